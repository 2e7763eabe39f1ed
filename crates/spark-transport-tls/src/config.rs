use std::{num::NonZeroUsize, thread};

use serde::Deserialize;

use crate::error::TlsError;

/// 委托任务（delegated task）的执行方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegatedTaskPolicy {
    /// 在驱动握手的线程上直接执行。
    Inline,
    /// 投递到固定大小的工作线程池。
    Pool,
}

/// TLS 会话驱动配置。
///
/// # 契约（What）
/// - `framework_threads`：套接字框架的并发线程数，委托任务池大小为其五分之一（向上取整）；
/// - `client_tasks` / `server_tasks`：客户端默认内联执行委托任务，服务端默认投递线程池；
/// - `task_thread_name`：工作线程名前缀，线程名形如 `{prefix}-{index}`；
/// - `max_accumulation_bytes`：密文累积区扩容上限，`None` 表示仅受引擎包尺寸约束。
///
/// # 实现（How）
/// - 通过 `serde` 反序列化，缺省字段回落到 [`Default`]；
/// - [`Self::from_toml_str`] 在解析后调用 [`Self::validate`]，保证非法配置不会进入会话。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsDriverConfig {
    pub framework_threads: usize,
    pub client_tasks: DelegatedTaskPolicy,
    pub server_tasks: DelegatedTaskPolicy,
    pub task_thread_name: String,
    pub max_accumulation_bytes: Option<usize>,
}

impl Default for TlsDriverConfig {
    fn default() -> Self {
        Self {
            framework_threads: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            client_tasks: DelegatedTaskPolicy::Inline,
            server_tasks: DelegatedTaskPolicy::Pool,
            task_thread_name: "spark-tls-task".to_owned(),
            max_accumulation_bytes: None,
        }
    }
}

impl TlsDriverConfig {
    /// 从 TOML 文本解析配置。
    pub fn from_toml_str(source: &str) -> Result<Self, TlsError> {
        let config: TlsDriverConfig =
            toml::from_str(source).map_err(|error| TlsError::Config(error.to_string().into()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值。
    pub fn validate(&self) -> Result<(), TlsError> {
        if self.framework_threads == 0 {
            return Err(TlsError::Config("framework_threads 必须大于 0".into()));
        }
        if self.task_thread_name.trim().is_empty() {
            return Err(TlsError::Config("task_thread_name 不能为空".into()));
        }
        if self.max_accumulation_bytes == Some(0) {
            return Err(TlsError::Config("max_accumulation_bytes 不能为 0".into()));
        }
        Ok(())
    }

    /// 委托任务池的线程数：`ceil(framework_threads / 5)`。
    pub fn task_pool_size(&self) -> usize {
        self.framework_threads.div_ceil(5).max(1)
    }
}
