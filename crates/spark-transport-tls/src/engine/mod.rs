//! TLS 引擎能力层。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话驱动只依赖“把明文包装成密文 / 把密文拆成明文”的显式 wrap/unwrap 协议，
//!   不关心记录格式、密钥交换或证书校验；把这些细节收敛到 [`TlsEngine`] 之后，
//!   驱动即可在 rustls 与测试用的确定性引擎之间切换。
//!
//! ## 契约（What）
//! - 每次 `wrap`/`unwrap` 返回 [`EngineResult`]：终态 [`EngineStatus`] 加上本次消费与产出的字节数；
//! - `BufferOverflow` 表示目标切片不足，引擎**不得**产出任何字节，调用方扩容后重试；
//! - `BufferUnderflow` 表示源切片不足一条完整记录，引擎**不得**消费任何字节；
//! - `Closed` 表示对应方向已完成关闭，可能同时产出（wrap 的 close_notify）或消费字节；
//! - [`HandshakeStatus`] 描述引擎下一步需要什么，驱动据此决定 wrap、unwrap 还是执行委托任务。
//!
//! ## 风险与权衡（Trade-offs）
//! - 引擎实例在会话生命周期内独占，不要求 `Sync`；跨线程只需 `Send`。

mod rustls_adapter;

pub use self::rustls_adapter::{APPLICATION_BUFFER_SIZE, PACKET_BUFFER_SIZE, RustlsEngine};

use crate::error::EngineError;

/// 引擎需要驱动方执行的下一步握手动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// 需要调用 `wrap` 产出握手或关闭报文。
    NeedWrap,
    /// 需要更多入站密文。
    NeedUnwrap,
    /// 需要先执行委托任务。
    NeedTask,
    /// 握手刚刚完成。
    Finished,
    /// 当前不处于握手中。
    NotHandshaking,
}

/// 单次 wrap/unwrap 的终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    BufferOverflow,
    BufferUnderflow,
    Closed,
}

/// 单次 wrap/unwrap 的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub consumed: usize,
    pub produced: usize,
}

impl EngineResult {
    pub fn new(status: EngineStatus, consumed: usize, produced: usize) -> Self {
        Self {
            status,
            consumed,
            produced,
        }
    }

    pub fn overflow(consumed: usize) -> Self {
        Self::new(EngineStatus::BufferOverflow, consumed, 0)
    }

    pub fn underflow() -> Self {
        Self::new(EngineStatus::BufferUnderflow, 0, 0)
    }
}

/// 需要在驱动线程之外执行的耗时计算（证书校验、密钥派生等）。
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// 不透明的单会话 TLS 引擎。
///
/// 实现者负责记录成帧与加解密；驱动负责缓冲、状态机与关闭时序。
pub trait TlsEngine: Send + 'static {
    /// 声明引擎以客户端或服务端身份工作，必须在握手开始前调用。
    fn set_client_mode(&mut self, client: bool);

    /// 发起（或重新发起）握手。
    fn begin_handshake(&mut self) -> Result<(), EngineError>;

    /// 查询下一步握手动作。
    fn handshake_status(&self) -> HandshakeStatus;

    /// 将 `src` 中的明文包装为密文写入 `dst`。
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// 从 `src` 中拆出一条记录，明文写入 `dst`。
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// 关闭入站方向；未收到对端 close_notify 时返回 [`EngineError::TruncatedClose`]。
    fn close_inbound(&mut self) -> Result<(), EngineError>;

    /// 关闭出站方向，后续 `wrap` 将产出 close_notify。
    fn close_outbound(&mut self);

    fn is_inbound_done(&self) -> bool;

    fn is_outbound_done(&self) -> bool;

    /// 取出一个待执行的委托任务。
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// 单条密文记录的最大尺寸。
    fn packet_buffer_size(&self) -> usize;

    /// 单条记录可承载的最大明文尺寸。
    fn application_buffer_size(&self) -> usize;
}
