use thiserror::Error;

/// 缓冲租约的误用错误。
///
/// # 意图（Why）
/// - 游标越界属于调用方逻辑错误，直接 panic 会让套接字线程整体崩溃；
///   以 `Result` 返回后，上层可以把它当作会话级故障上报。
///
/// # 契约（What）
/// - `requested` 为调用方试图推进的字节数，`available` 为当前允许的上限；
/// - 发生错误时缓冲游标保持原状，不会出现“推进一半”的中间态。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// 写游标推进超过空闲区。
    #[error("写游标推进 {requested} 字节，但空闲区仅剩 {available} 字节")]
    CommitOverflow { requested: usize, available: usize },
    /// 读游标推进超过可读区。
    #[error("读游标推进 {requested} 字节，但可读区仅有 {available} 字节")]
    ConsumeOverflow { requested: usize, available: usize },
}
