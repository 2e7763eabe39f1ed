use spark_buffer::PooledBuffer;

use crate::error::TlsError;

/// 套接字关闭的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 本端主动关闭。
    LocalClose,
    /// 本端因异常关闭。
    LocalCloseByException,
    /// 对端关闭。
    RemoteClose,
    /// 对端异常断开。
    RemoteCloseByException,
}

impl DisconnectReason {
    /// 是否由对端发起；对端发起时不再尝试关闭握手。
    pub fn is_remote(self) -> bool {
        matches!(
            self,
            DisconnectReason::RemoteClose | DisconnectReason::RemoteCloseByException
        )
    }
}

/// 写入完成回调：套接字在数据真正写出后把租约交回，由驱动负责释放。
pub type WriteDone = Box<dyn FnOnce(PooledBuffer) + Send + 'static>;

/// 恢复回调：由套接字框架在自己的事件循环上调用，重新进入握手驱动。
pub type Resume = Box<dyn FnOnce() + Send + 'static>;

/// 异步套接字框架暴露给 TLS 驱动的最小能力集。
///
/// # 契约（What）
/// - `write`：非阻塞地排队一段密文，写出完成后恰好调用一次 `on_complete`；
///   多次 `write` 的写出顺序必须与调用顺序一致；
/// - `close`：请求关闭底层连接，框架随后应调用 [`TlsConnection::pre_close`]；
/// - `report_error`：上报会话级故障，会话本身保持打开，由框架决定后续处置；
/// - `wake`：委托任务在工作线程上完成后调用，框架应把 `resume` 调度为一次普通 I/O 事件，
///   默认实现直接在当前线程执行。
///
/// 驱动调用上述方法时从不持有会话锁，实现可以安全地回调 [`TlsConnection`]。
///
/// [`TlsConnection`]: crate::TlsConnection
/// [`TlsConnection::pre_close`]: crate::TlsConnection::pre_close
pub trait SocketIo: Send + Sync + 'static {
    fn write(&self, ciphertext: PooledBuffer, on_complete: WriteDone);

    fn close(&self, reason: DisconnectReason);

    fn report_error(&self, error: TlsError);

    fn wake(&self, resume: Resume) {
        resume();
    }
}
