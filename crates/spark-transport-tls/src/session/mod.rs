//! TLS 会话驱动。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 在事件驱动的套接字框架之上提供非阻塞 TLS：任何一步缺少输入都**挂起**而不是阻塞，
//!   待下一次 I/O 事件到来时从断点继续；
//! - 握手、记录加解密、关闭握手共享同一个引擎与同一块密文累积区，必须由单一所有者串行推进。
//!
//! ## 结构（How）
//! - `executor`：单次 wrap/unwrap 执行器，负责目标缓冲扩容、累积区扩容与引擎关闭状态迁移；
//! - `handshake`：握手状态机循环，按引擎报告的 [`HandshakeStatus`] 选择 wrap、unwrap 或委托任务；
//! - 本模块：[`TlsSession`] 的状态与对外操作（开始握手、加密、填充、解密、关闭）。
//!
//! ## 契约（What）
//! - [`HandshakeState`] 单调推进，仅重新协商时由 `Complete` 回到 `InProgress`；
//! - [`CloseState`] 单调推进；`Closed` 意味着引擎两个方向均已关闭（或已被强制关闭）；
//! - 会话不直接调用套接字：写出、关闭请求、故障与完成回调都记录为 [`SessionEvent`]，
//!   由持锁方在释放锁之后按序派发，保证回调可以安全地重入连接。
//!
//! [`HandshakeStatus`]: crate::engine::HandshakeStatus

mod executor;
mod handshake;

use std::{collections::VecDeque, fmt, mem, sync::Arc};

use bytes::BytesMut;
use spark_buffer::{PooledBuffer, SlabBufferPool};
use tracing::{debug, warn};

use crate::{
    engine::TlsEngine,
    error::TlsError,
    socket::DisconnectReason,
    tasks::TaskPool,
};

/// 握手完成回调。
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// 委托任务完成后用于重新进入握手驱动的钩子。
pub(crate) type ResumeHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// 会话角色，创建时确定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Client,
    Server,
}

impl SessionMode {
    pub fn is_client(self) -> bool {
        matches!(self, SessionMode::Client)
    }
}

/// 握手进度。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    InProgress,
    Complete,
}

/// 关闭进度。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Open,
    /// 关闭流程已发起（本端 `close_ssl` 或引擎报告对端关闭）。
    ClosingLocal,
    Closed,
}

/// 委托任务的执行位置。
#[derive(Clone)]
pub enum TaskDispatch {
    Inline,
    Pool(Arc<TaskPool>),
}

impl fmt::Debug for TaskDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskDispatch::Inline => f.write_str("Inline"),
            TaskDispatch::Pool(pool) => f.debug_tuple("Pool").field(&pool.size()).finish(),
        }
    }
}

/// 密文写出的来源。
pub(crate) enum TransmitOrigin {
    /// 握手或关闭握手报文；写出完成后可能需要继续推进握手。
    Handshake,
    /// 应用数据，写出完成后调用调用方回调。
    Application(CompletionCallback),
}

/// 会话在持锁期间产生、需要在锁外派发的副作用。
pub(crate) enum SessionEvent {
    Transmit {
        ciphertext: PooledBuffer,
        origin: TransmitOrigin,
    },
    Shutdown(DisconnectReason),
    Fault(TlsError),
    Notify(Vec<CompletionCallback>),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Transmit { ciphertext, origin } => f
                .debug_struct("Transmit")
                .field("len", &ciphertext.len())
                .field(
                    "handshake",
                    &matches!(origin, TransmitOrigin::Handshake),
                )
                .finish(),
            SessionEvent::Shutdown(reason) => f.debug_tuple("Shutdown").field(reason).finish(),
            SessionEvent::Fault(error) => f.debug_tuple("Fault").field(error).finish(),
            SessionEvent::Notify(callbacks) => {
                f.debug_tuple("Notify").field(&callbacks.len()).finish()
            }
        }
    }
}

/// 单个连接的 TLS 会话驱动。
///
/// # 契约（What）
/// - 由所属套接字独占；所有操作需在同一串行化边界内调用（见 [`crate::TlsConnection`]）；
/// - 任意时刻至多一个累积区租约、至多一次进行中的 wrap/unwrap；
/// - 引擎故障通过 [`SessionEvent::Fault`] 上报，会话保持打开。
pub struct TlsSession<E: TlsEngine> {
    engine: E,
    mode: SessionMode,
    pool: SlabBufferPool,
    tasks: TaskDispatch,
    handshake: HandshakeState,
    close: CloseState,
    waiting_for_unwrap: bool,
    close_reason: Option<DisconnectReason>,
    shutdown_requested: bool,
    accumulation: Option<PooledBuffer>,
    absorbed: usize,
    accumulation_limit: Option<usize>,
    accumulation_growths: usize,
    completion_callbacks: Vec<CompletionCallback>,
    resume_hook: Option<ResumeHook>,
    events: VecDeque<SessionEvent>,
}

impl<E: TlsEngine> TlsSession<E> {
    pub fn new(mut engine: E, mode: SessionMode, pool: SlabBufferPool, tasks: TaskDispatch) -> Self {
        engine.set_client_mode(mode.is_client());
        Self {
            engine,
            mode,
            pool,
            tasks,
            handshake: HandshakeState::Idle,
            close: CloseState::Open,
            waiting_for_unwrap: false,
            close_reason: None,
            shutdown_requested: false,
            accumulation: None,
            absorbed: 0,
            accumulation_limit: None,
            accumulation_growths: 0,
            completion_callbacks: Vec::new(),
            resume_hook: None,
            events: VecDeque::new(),
        }
    }

    /// 设置累积区扩容上限。
    pub fn with_accumulation_limit(mut self, limit: Option<usize>) -> Self {
        self.accumulation_limit = limit;
        self
    }

    pub(crate) fn set_resume_hook(&mut self, hook: ResumeHook) {
        self.resume_hook = Some(hook);
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    pub fn close_state(&self) -> CloseState {
        self.close
    }

    pub fn has_handshake_begun(&self) -> bool {
        self.handshake != HandshakeState::Idle
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake == HandshakeState::Complete
    }

    pub fn is_handshaking(&self) -> bool {
        self.handshake == HandshakeState::InProgress
    }

    pub fn is_waiting_for_unwrap(&self) -> bool {
        self.waiting_for_unwrap
    }

    pub fn has_initiated_close(&self) -> bool {
        self.close != CloseState::Open
    }

    pub fn is_inbound_done(&self) -> bool {
        self.engine.is_inbound_done()
    }

    /// 当前累积区容量；尚未创建或已释放时为 `None`。
    pub fn accumulation_capacity(&self) -> Option<usize> {
        self.accumulation.as_ref().map(PooledBuffer::capacity)
    }

    /// 累积区因缓冲不足而扩容的次数。
    pub fn accumulation_growths(&self) -> usize {
        self.accumulation_growths
    }

    /// 累积区中尚未交给引擎的密文字节数。
    pub fn buffered_ciphertext(&self) -> usize {
        self.accumulation.as_ref().map_or(0, PooledBuffer::len)
    }

    /// 开始（或重新开始）握手。
    ///
    /// 先调用引擎初始化，成功后才把状态置为 `InProgress` 并运行握手驱动；
    /// 引擎拒绝时上报故障，状态保持不变。
    pub fn begin_handshake(&mut self) {
        if self.close == CloseState::Closed {
            return;
        }
        if self.handshake == HandshakeState::InProgress {
            debug!(mode = ?self.mode, "握手已在进行中，忽略重复的开始请求");
            return;
        }
        if let Err(error) = self.engine.begin_handshake() {
            warn!(mode = ?self.mode, %error, "引擎拒绝开始握手");
            self.fault(error.into());
            return;
        }
        debug!(mode = ?self.mode, renegotiation = self.handshake == HandshakeState::Complete, "开始 TLS 握手");
        self.handshake = HandshakeState::InProgress;
        self.waiting_for_unwrap = false;
        self.drive_handshake();
    }

    /// 由外部 I/O 事件（写出完成、委托任务完成）重新进入握手驱动。
    pub fn resume_handshake(&mut self) {
        if self.handshake == HandshakeState::InProgress && !self.waiting_for_unwrap {
            self.drive_handshake();
        }
    }

    /// 登记握手完成回调；握手已完成时原样交还，由调用方立即执行。
    pub fn register_completion(
        &mut self,
        callback: CompletionCallback,
    ) -> Option<CompletionCallback> {
        if self.handshake == HandshakeState::Complete {
            return Some(callback);
        }
        self.completion_callbacks.push(callback);
        None
    }

    /// 登记握手完成回调；握手已完成时同步执行。
    pub fn on_handshake_complete(&mut self, callback: impl FnOnce() + Send + 'static) {
        if let Some(callback) = self.register_completion(Box::new(callback)) {
            callback();
        }
    }

    /// 加密一段明文，返回密文租约；引擎故障或会话已关闭时返回 `None`。
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Option<PooledBuffer> {
        self.execute_wrap(plaintext).into_output()
    }

    /// 把套接字原始读缓冲中新到达的字节并入累积区。
    ///
    /// `raw` 属于套接字框架且只会被追加；已并入的前缀由 `absorbed` 记录，
    /// 全部并入后清空 `raw` 并复位计数。返回本次并入的字节数。
    pub fn fill_read_buffer(&mut self, raw: &mut BytesMut) -> usize {
        if self.close == CloseState::Closed {
            return 0;
        }
        if self.absorbed > raw.len() {
            // 框架在外部丢弃了读缓冲，重新计数。
            self.absorbed = 0;
        }
        if self.absorbed == raw.len() {
            if !raw.is_empty() {
                raw.clear();
                self.absorbed = 0;
            }
            return 0;
        }
        let start = self.absorbed;
        let copied = self.accumulation_mut().put_slice(&raw[start..]);
        self.absorbed += copied;
        if self.absorbed == raw.len() {
            raw.clear();
            self.absorbed = 0;
        }
        copied
    }

    /// `raw` 中是否还有累积区能够吸收的字节。
    pub fn can_absorb(&self, raw: &BytesMut) -> bool {
        self.close != CloseState::Closed
            && raw.len() > self.absorbed
            && self
                .accumulation
                .as_ref()
                .is_none_or(|accumulation| accumulation.spare_capacity() > 0)
    }

    /// 从累积区解出一条记录。
    ///
    /// 若握手正等待输入，先消费一次只用于握手的 unwrap（输出丢弃）并重新进入握手驱动；
    /// 只有握手因此完成且累积区仍有密文时，才继续一次完整的 unwrap 并返回其明文。
    pub fn decrypt(&mut self) -> Option<PooledBuffer> {
        if self.close == CloseState::Closed {
            return None;
        }
        if mem::take(&mut self.waiting_for_unwrap) {
            self.execute_unwrap().into_output()?;
            self.drive_handshake();
            if self.handshake != HandshakeState::Complete || self.buffered_ciphertext() == 0 {
                return None;
            }
        }
        let plaintext = self.execute_unwrap().into_output()?;
        self.detect_renegotiation();
        Some(plaintext)
    }

    /// 发起关闭握手。
    ///
    /// 返回 `true` 表示套接字可以立即关闭；返回 `false` 表示关闭握手已开始，
    /// 底层关闭会在对端 close_notify 到达后以 [`SessionEvent::Shutdown`] 请求。
    pub fn close_ssl(&mut self, reason: DisconnectReason) -> bool {
        if self.has_initiated_close() {
            return true;
        }
        if reason.is_remote() || self.handshake == HandshakeState::Idle {
            self.force_closure();
            return true;
        }
        debug!(mode = ?self.mode, ?reason, "发起 TLS 关闭握手");
        self.close_reason = Some(reason);
        self.close = CloseState::ClosingLocal;
        self.engine.close_outbound();
        self.drive_handshake();
        false
    }

    /// 立即关闭会话，不再进行任何关闭握手。
    pub fn force_closure(&mut self) {
        if self.close == CloseState::Closed {
            return;
        }
        debug!(mode = ?self.mode, "强制关闭 TLS 会话");
        self.close = CloseState::Closed;
        self.waiting_for_unwrap = false;
        self.engine.close_outbound();
        if let Err(error) = self.engine.close_inbound() {
            debug!(%error, "强制关闭时入站方向未正常结束");
            self.fault(error.into());
        }
        self.release_accumulation();
    }

    pub(crate) fn take_events(&mut self) -> VecDeque<SessionEvent> {
        mem::take(&mut self.events)
    }

    pub(crate) fn push_event(&mut self, event: SessionEvent) {
        self.events.push_back(event);
    }

    fn fault(&mut self, error: TlsError) {
        self.events.push_back(SessionEvent::Fault(error));
    }

    fn accumulation_mut(&mut self) -> &mut PooledBuffer {
        let pool = &self.pool;
        let capacity = self.engine.packet_buffer_size();
        self.accumulation
            .get_or_insert_with(|| pool.acquire(capacity))
    }

    fn release_accumulation(&mut self) {
        self.accumulation = None;
        self.absorbed = 0;
    }

    fn request_shutdown(&mut self) {
        if mem::replace(&mut self.shutdown_requested, true) {
            return;
        }
        let reason = self
            .close_reason
            .take()
            .unwrap_or(DisconnectReason::RemoteClose);
        debug!(mode = ?self.mode, ?reason, "TLS 双向关闭完成，请求关闭底层套接字");
        self.events.push_back(SessionEvent::Shutdown(reason));
    }

    /// 握手完成后对端重新发起握手时，恢复为 `InProgress` 并继续驱动。
    fn detect_renegotiation(&mut self) {
        use crate::engine::HandshakeStatus::*;

        if self.handshake != HandshakeState::Complete || self.close != CloseState::Open {
            return;
        }
        if matches!(self.engine.handshake_status(), NeedWrap | NeedUnwrap | NeedTask) {
            debug!(mode = ?self.mode, "对端发起重新协商");
            self.handshake = HandshakeState::InProgress;
            self.drive_handshake();
        }
    }
}

impl<E: TlsEngine> fmt::Debug for TlsSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("mode", &self.mode)
            .field("handshake", &self.handshake)
            .field("close", &self.close)
            .field("waiting_for_unwrap", &self.waiting_for_unwrap)
            .field("buffered", &self.buffered_ciphertext())
            .finish_non_exhaustive()
    }
}

/// 单次执行器调用的结果。
pub(crate) enum Step {
    /// 得到输出（可能为空）。
    Produced(PooledBuffer),
    /// 缺少输入，尚无结果。
    Pending,
    /// 故障或会话已关闭。
    Aborted,
}

impl Step {
    fn into_output(self) -> Option<PooledBuffer> {
        match self {
            Step::Produced(output) => Some(output),
            Step::Pending | Step::Aborted => None,
        }
    }
}

#[cfg(test)]
mod tests;
