//! 测试桩：确定性的回环引擎、记录型套接字与收集型读请求。
//!
//! # 设计动机（Why）
//! - 会话驱动的大部分行为（挂起、扩容、关闭时序、委托任务）与密码学无关，
//!   用一个记录格式极简、可配置包尺寸的引擎即可逐步复现；
//! - 集成测试与下游 crate 共享同一套桩件，避免各自手写套接字模拟。
//!
//! # 组成（What）
//! - [`LoopbackEngine`]：三步握手（HELLO → WELCOME → FINISHED）+ 异或“加密”的应用记录，
//!   可选服务端委托任务，握手期与建立后使用不同的包尺寸；
//! - [`RecordingSocket`]：记录写出的密文、关闭请求与故障，写出完成可立即或延后回调；
//! - [`CollectingReader`]：收集明文，可限制每次消费的字节数以制造部分消费；
//! - [`Endpoint`] 与 [`pump`]：把两端连接起来，反复搬运密文直到静默。

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::BytesMut;
use parking_lot::Mutex;
use spark_buffer::PooledBuffer;

use crate::{
    connection::TlsConnection,
    engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, TlsEngine},
    error::{EngineError, TlsError},
    reader::ReadRequests,
    socket::{DisconnectReason, Resume, SocketIo, WriteDone},
};

const KIND_ALERT: u8 = 0x15;
const KIND_HANDSHAKE: u8 = 0x16;
const KIND_APPLICATION: u8 = 0x17;
const HEADER_LEN: usize = 3;

const MSG_HELLO: u8 = 1;
const MSG_WELCOME: u8 = 2;
const MSG_FINISHED: u8 = 3;

const XOR_KEY: u8 = 0x5A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    SendHello,
    AwaitWelcome,
    SendFinished,
    AwaitHello,
    RunTask,
    SendWelcome,
    AwaitFinished,
    Established,
}

/// 确定性回环引擎。
///
/// 记录格式为 `[kind:u8][len:u16 BE][payload]`；应用数据逐字节与固定密钥异或。
pub struct LoopbackEngine {
    client: bool,
    phase: Phase,
    with_task: bool,
    task: Option<DelegatedTask>,
    task_done: Arc<AtomicBool>,
    handshake_packet: usize,
    established_packet: usize,
    close_requested: bool,
    close_sent: bool,
    peer_closed: bool,
    inbound_closed: bool,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            client: false,
            phase: Phase::Idle,
            with_task: false,
            task: None,
            task_done: Arc::new(AtomicBool::new(false)),
            handshake_packet: 64,
            established_packet: 4096,
            close_requested: false,
            close_sent: false,
            peer_closed: false,
            inbound_closed: false,
        }
    }

    /// 握手期与建立后的包尺寸。
    pub fn with_packet_sizes(mut self, handshake: usize, established: usize) -> Self {
        self.handshake_packet = handshake.max(HEADER_LEN + 1);
        self.established_packet = established.max(HEADER_LEN + 1);
        self
    }

    /// 服务端收到 HELLO 后需要先执行一个委托任务。
    pub fn with_delegated_task(mut self) -> Self {
        self.with_task = true;
        self
    }

    /// 以回环格式编码一条应用记录，供测试构造入站密文。
    pub fn encode_application(payload: &[u8]) -> Vec<u8> {
        let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
        record.push(KIND_APPLICATION);
        record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        record.extend(payload.iter().map(|byte| byte ^ XOR_KEY));
        record
    }

    fn normalize_phase(&mut self) {
        if self.phase == Phase::RunTask && self.task_done.load(Ordering::Acquire) {
            self.phase = Phase::SendWelcome;
        }
    }

    fn accept_handshake(&mut self, message: u8) -> Result<(), EngineError> {
        self.phase = match (self.phase, message) {
            (Phase::AwaitHello, MSG_HELLO) if self.with_task => {
                let done = Arc::clone(&self.task_done);
                done.store(false, Ordering::Release);
                self.task = Some(Box::new(move || done.store(true, Ordering::Release)));
                Phase::RunTask
            }
            (Phase::AwaitHello, MSG_HELLO) => Phase::SendWelcome,
            (Phase::Established, MSG_HELLO) if !self.client => Phase::SendWelcome,
            (Phase::AwaitWelcome, MSG_WELCOME) => Phase::SendFinished,
            (Phase::AwaitFinished, MSG_FINISHED) => Phase::Established,
            (phase, message) => {
                return Err(EngineError::Protocol(
                    format!("阶段 {phase:?} 收到意外的握手消息 {message}").into(),
                ));
            }
        };
        Ok(())
    }
}

fn write_header(dst: &mut [u8], kind: u8, len: usize) {
    dst[0] = kind;
    dst[1..HEADER_LEN].copy_from_slice(&(len as u16).to_be_bytes());
}

impl TlsEngine for LoopbackEngine {
    fn set_client_mode(&mut self, client: bool) {
        self.client = client;
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        self.phase = match (self.phase, self.client) {
            (Phase::Idle | Phase::Established, true) => Phase::SendHello,
            (Phase::Idle, false) => Phase::AwaitHello,
            (Phase::Established, false) => return Err(EngineError::RenegotiationUnsupported),
            (phase, _) => phase,
        };
        Ok(())
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if (self.close_requested || self.peer_closed) && !self.close_sent {
            return HandshakeStatus::NeedWrap;
        }
        match self.phase {
            Phase::SendHello | Phase::SendWelcome | Phase::SendFinished => {
                HandshakeStatus::NeedWrap
            }
            Phase::AwaitHello | Phase::AwaitWelcome | Phase::AwaitFinished => {
                HandshakeStatus::NeedUnwrap
            }
            Phase::RunTask if self.task_done.load(Ordering::Acquire) => HandshakeStatus::NeedWrap,
            Phase::RunTask => HandshakeStatus::NeedTask,
            Phase::Idle | Phase::Established => HandshakeStatus::NotHandshaking,
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if self.peer_closed {
            self.close_requested = true;
        }
        if self.close_requested {
            if self.close_sent {
                return Ok(EngineResult::new(EngineStatus::Closed, 0, 0));
            }
            if dst.len() < HEADER_LEN {
                return Ok(EngineResult::overflow(0));
            }
            write_header(dst, KIND_ALERT, 0);
            self.close_sent = true;
            return Ok(EngineResult::new(EngineStatus::Closed, 0, HEADER_LEN));
        }

        self.normalize_phase();
        let (message, next) = match self.phase {
            Phase::SendHello => (MSG_HELLO, Phase::AwaitWelcome),
            Phase::SendWelcome => (MSG_WELCOME, Phase::AwaitFinished),
            Phase::SendFinished => (MSG_FINISHED, Phase::Established),
            Phase::Established => {
                if src.is_empty() {
                    return Ok(EngineResult::new(EngineStatus::Ok, 0, 0));
                }
                let chunk = src.len().min(self.application_buffer_size());
                if dst.len() < HEADER_LEN + chunk {
                    return Ok(EngineResult::overflow(0));
                }
                write_header(dst, KIND_APPLICATION, chunk);
                for (out, byte) in dst[HEADER_LEN..HEADER_LEN + chunk].iter_mut().zip(src) {
                    *out = byte ^ XOR_KEY;
                }
                return Ok(EngineResult::new(EngineStatus::Ok, chunk, HEADER_LEN + chunk));
            }
            _ => return Ok(EngineResult::new(EngineStatus::Ok, 0, 0)),
        };
        if dst.len() < HEADER_LEN + 1 {
            return Ok(EngineResult::overflow(0));
        }
        write_header(dst, KIND_HANDSHAKE, 1);
        dst[HEADER_LEN] = message;
        self.phase = next;
        Ok(EngineResult::new(EngineStatus::Ok, 0, HEADER_LEN + 1))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if self.is_inbound_done() {
            return Ok(EngineResult::new(EngineStatus::Closed, 0, 0));
        }
        if src.len() < HEADER_LEN {
            return Ok(EngineResult::underflow());
        }
        let len = usize::from(u16::from_be_bytes([src[1], src[2]]));
        let total = HEADER_LEN + len;
        if src.len() < total {
            return Ok(EngineResult::underflow());
        }
        let payload = &src[HEADER_LEN..total];
        match src[0] {
            KIND_ALERT => {
                self.peer_closed = true;
                Ok(EngineResult::new(EngineStatus::Closed, total, 0))
            }
            KIND_HANDSHAKE if len == 1 => {
                self.accept_handshake(payload[0])?;
                Ok(EngineResult::new(EngineStatus::Ok, total, 0))
            }
            KIND_APPLICATION if self.phase == Phase::Established => {
                if len > dst.len() {
                    return Ok(EngineResult::overflow(0));
                }
                for (out, byte) in dst[..len].iter_mut().zip(payload) {
                    *out = byte ^ XOR_KEY;
                }
                Ok(EngineResult::new(EngineStatus::Ok, total, len))
            }
            kind => Err(EngineError::Protocol(
                format!("阶段 {:?} 收到无法处理的记录类型 {kind:#04x}", self.phase).into(),
            )),
        }
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        self.inbound_closed = true;
        if self.peer_closed {
            Ok(())
        } else {
            Err(EngineError::TruncatedClose)
        }
    }

    fn close_outbound(&mut self) {
        self.close_requested = true;
    }

    fn is_inbound_done(&self) -> bool {
        self.peer_closed || self.inbound_closed
    }

    fn is_outbound_done(&self) -> bool {
        self.close_sent
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        self.task.take()
    }

    fn packet_buffer_size(&self) -> usize {
        if self.phase == Phase::Established {
            self.established_packet
        } else {
            self.handshake_packet
        }
    }

    fn application_buffer_size(&self) -> usize {
        self.packet_buffer_size() - HEADER_LEN
    }
}

#[derive(Default)]
struct RecordingState {
    outbound: BytesMut,
    writes: usize,
    closes: Vec<DisconnectReason>,
    errors: Vec<TlsError>,
    deferred: bool,
    completions: Vec<(PooledBuffer, WriteDone)>,
}

/// 记录型套接字。
#[derive(Default)]
pub struct RecordingSocket {
    state: Mutex<RecordingState>,
}

impl RecordingSocket {
    /// 写出立即完成。
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 写出完成延后到 [`Self::complete_writes`]。
    pub fn deferred() -> Arc<Self> {
        let socket = Self::default();
        socket.state.lock().deferred = true;
        Arc::new(socket)
    }

    /// 取走已写出、尚未被对端读取的密文。
    pub fn take_outbound(&self) -> BytesMut {
        self.state.lock().outbound.split()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    pub fn closes(&self) -> Vec<DisconnectReason> {
        self.state.lock().closes.clone()
    }

    /// 已上报故障的错误码。
    pub fn error_codes(&self) -> Vec<&'static str> {
        self.state.lock().errors.iter().map(TlsError::code).collect()
    }

    /// 完成所有延后的写出，返回完成的数量。
    pub fn complete_writes(&self) -> usize {
        let completions = std::mem::take(&mut self.state.lock().completions);
        let count = completions.len();
        for (lease, done) in completions {
            done(lease);
        }
        count
    }
}

impl SocketIo for RecordingSocket {
    fn write(&self, ciphertext: PooledBuffer, on_complete: WriteDone) {
        let mut state = self.state.lock();
        state.outbound.extend_from_slice(ciphertext.readable());
        state.writes += 1;
        if state.deferred {
            state.completions.push((ciphertext, on_complete));
            return;
        }
        drop(state);
        on_complete(ciphertext);
    }

    fn close(&self, reason: DisconnectReason) {
        self.state.lock().closes.push(reason);
    }

    fn report_error(&self, error: TlsError) {
        self.state.lock().errors.push(error);
    }

    fn wake(&self, resume: Resume) {
        resume();
    }
}

/// 收集型读请求。
#[derive(Debug, Default)]
pub struct CollectingReader {
    pub received: Vec<u8>,
    /// 每次 `deliver` 最多消费的字节数；`None` 表示全部消费。
    pub limit: Option<usize>,
    pub deliveries: usize,
    pub no_data_signals: usize,
}

impl CollectingReader {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl ReadRequests for CollectingReader {
    fn deliver(&mut self, decrypted: &mut PooledBuffer) {
        let take = self
            .limit
            .map_or(decrypted.len(), |limit| limit.min(decrypted.len()));
        self.received
            .extend_from_slice(&decrypted.readable()[..take]);
        self.deliveries += 1;
        let _ = decrypted.consume(take);
    }

    fn no_data(&mut self) {
        self.no_data_signals += 1;
    }
}

/// 测试中的一端：连接、其套接字、原始读缓冲与读请求。
pub struct Endpoint<E: TlsEngine> {
    pub connection: TlsConnection<E, RecordingSocket>,
    pub socket: Arc<RecordingSocket>,
    pub raw: BytesMut,
    pub reader: CollectingReader,
}

impl<E: TlsEngine> Endpoint<E> {
    pub fn new(connection: TlsConnection<E, RecordingSocket>) -> Self {
        let socket = Arc::clone(connection.socket());
        Self {
            connection,
            socket,
            raw: BytesMut::new(),
            reader: CollectingReader::default(),
        }
    }

    /// 把一段密文追加到原始读缓冲并触发一次读事件。
    pub fn receive(&mut self, bytes: &[u8]) -> usize {
        self.raw.extend_from_slice(bytes);
        self.connection.on_read(&mut self.raw, &mut self.reader)
    }
}

/// 在两端之间反复搬运密文，直到双方都不再写出；返回搬运的总字节数。
pub fn pump<A: TlsEngine, B: TlsEngine>(a: &mut Endpoint<A>, b: &mut Endpoint<B>) -> usize {
    let mut moved = 0;
    for _ in 0..256 {
        let to_b = a.socket.take_outbound();
        let to_a = b.socket.take_outbound();
        if to_b.is_empty() && to_a.is_empty() {
            break;
        }
        moved += to_b.len() + to_a.len();
        if !to_b.is_empty() {
            b.receive(&to_b);
        }
        if !to_a.is_empty() {
            a.receive(&to_a);
        }
    }
    moved
}
