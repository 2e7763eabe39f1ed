use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::SendError};
use tracing::{debug, warn};

use crate::{config::TlsDriverConfig, engine::DelegatedTask, error::TlsError};

/// 委托任务工作线程池。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 证书校验、密钥派生等计算不应占用套接字事件线程；服务端会话把它们投递到固定线程池，
///   事件线程立即返回，任务完成后由下一次 I/O 事件推进握手。
///
/// ## 逻辑（How）
/// - 任务经 `tokio::sync::mpsc` 无界通道排队，工作线程在 `parking_lot::Mutex` 保护下轮流
///   `blocking_recv`，形成“多生产者、多消费者”的简单队列；
/// - 线程由 `std::thread::Builder` 创建并按 `{prefix}-{index}` 命名，便于在线程转储中定位；
/// - `Drop` 时关闭发送端，工作线程取尽队列后退出并被回收。
///
/// ## 风险与权衡（Trade-offs）
/// - 任务 panic 会被捕获并记录，不会拖垮工作线程；
/// - 若最后一个引用在工作线程内部被释放，`Drop` 跳过对自身的 `join`，避免自等待。
pub struct TaskPool {
    sender: Option<UnboundedSender<DelegatedTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// 创建 `threads` 个工作线程。
    pub fn new(threads: usize, name_prefix: &str) -> Result<Self, TlsError> {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<DelegatedTask>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{name_prefix}-{index}"))
                .spawn(move || worker_loop(&receiver))
                .map_err(|error| TlsError::TaskPool(error.to_string().into()))?;
            workers.push(handle);
        }
        debug!(threads, prefix = name_prefix, "委托任务线程池已启动");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// 按配置创建线程池，大小为 `ceil(framework_threads / 5)`。
    pub fn for_config(config: &TlsDriverConfig) -> Result<Self, TlsError> {
        Self::new(config.task_pool_size(), &config.task_thread_name)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// 投递任务；线程池已关闭时把任务原样交还调用方。
    pub fn try_execute(&self, task: DelegatedTask) -> Result<(), DelegatedTask> {
        match &self.sender {
            Some(sender) => sender.send(task).map_err(|SendError(task)| task),
            None => Err(task),
        }
    }
}

fn worker_loop(receiver: &Mutex<UnboundedReceiver<DelegatedTask>>) {
    loop {
        let next = receiver.lock().blocking_recv();
        let Some(task) = next else {
            break;
        };
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("委托任务执行时发生 panic");
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.sender.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.workers.len())
            .finish_non_exhaustive()
    }
}
