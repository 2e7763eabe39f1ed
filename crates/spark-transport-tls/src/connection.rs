use std::{
    collections::VecDeque,
    fmt, mem,
    sync::{Arc, Weak},
    thread,
};

use bytes::BytesMut;
use parking_lot::Mutex;
use spark_buffer::SlabBufferPool;
use tracing::{debug, warn};

use crate::{
    config::{DelegatedTaskPolicy, TlsDriverConfig},
    engine::TlsEngine,
    error::TlsError,
    reader::{PendingSupply, ReadRequests, RecordDecryptor},
    session::{
        HandshakeState, SessionEvent, SessionMode, TaskDispatch, TlsSession, TransmitOrigin,
    },
    socket::{DisconnectReason, SocketIo, WriteDone},
    tasks::TaskPool,
    writer::RecordEncryptor,
};

/// 单个套接字的 TLS 连接包装。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读事件、调用方写入、写出完成、委托任务完成可能来自不同线程，
///   会话状态、累积区与待处理明文队列必须处于同一个串行化边界内；
/// - 套接字回调（写出、关闭、上报错误、完成回调）又可能同步地重入连接，
///   若在持锁期间调用就会自锁。
///
/// ## 逻辑（How）
/// - `core` 是唯一的 `parking_lot::Mutex`，所有会话操作都在其中执行；
/// - 会话产生的副作用在持锁期间移入 `outbox`，释放 `core` 之后再逐个派发；
/// - `outbox` 由“当前派发者”独占清空：其它线程或重入调用只追加事件，
///   因而密文写出顺序与会话产生顺序严格一致，同时不会出现递归派发。
///
/// ## 契约（What）
/// - [`ReadRequests::deliver`] 在持锁期间调用，实现不得同步重入同一连接；
///   需要回写时应在完成回调或下一次事件中进行；
/// - 克隆得到的句柄共享同一连接。
pub struct TlsConnection<E: TlsEngine, S: SocketIo> {
    inner: Arc<Shared<E, S>>,
}

struct Shared<E: TlsEngine, S: SocketIo> {
    core: Mutex<Core<E>>,
    outbox: Mutex<Outbox>,
    socket: Arc<S>,
}

struct Core<E: TlsEngine> {
    session: TlsSession<E>,
    decryptor: RecordDecryptor,
    encryptor: RecordEncryptor,
    force_closure: bool,
}

#[derive(Default)]
struct Outbox {
    events: VecDeque<SessionEvent>,
    draining: bool,
}

/// 派发过程中 panic 时释放派发权，避免后续事件永远滞留。
struct DrainGuard<'a>(&'a Mutex<Outbox>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

impl<E: TlsEngine, S: SocketIo> Clone for TlsConnection<E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: TlsEngine, S: SocketIo> TlsConnection<E, S> {
    /// 用已构造的会话创建连接。
    pub fn new(session: TlsSession<E>, socket: Arc<S>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Shared<E, S>>| {
            let mut session = session;
            let target = weak.clone();
            session.set_resume_hook(Arc::new(move || {
                let Some(shared) = target.upgrade() else {
                    return;
                };
                let socket = Arc::clone(&shared.socket);
                socket.wake(Box::new(move || {
                    TlsConnection { inner: shared }.resume_handshake();
                }));
            }));
            Shared {
                core: Mutex::new(Core {
                    session,
                    decryptor: RecordDecryptor::new(),
                    encryptor: RecordEncryptor::new(),
                    force_closure: false,
                }),
                outbox: Mutex::new(Outbox::default()),
                socket,
            }
        });
        Self { inner }
    }

    /// 客户端连接：按 `client_tasks` 策略执行委托任务（默认内联）。
    pub fn client(
        engine: E,
        socket: Arc<S>,
        buffers: SlabBufferPool,
        config: &TlsDriverConfig,
    ) -> Result<Self, TlsError> {
        Self::with_mode(engine, SessionMode::Client, socket, buffers, config, None)
    }

    /// 服务端连接：按 `server_tasks` 策略执行委托任务（默认线程池）。
    ///
    /// 传入 `tasks` 时多个连接共享同一线程池，否则按配置为该连接单独创建。
    pub fn server(
        engine: E,
        socket: Arc<S>,
        buffers: SlabBufferPool,
        config: &TlsDriverConfig,
        tasks: Option<Arc<TaskPool>>,
    ) -> Result<Self, TlsError> {
        Self::with_mode(engine, SessionMode::Server, socket, buffers, config, tasks)
    }

    fn with_mode(
        engine: E,
        mode: SessionMode,
        socket: Arc<S>,
        buffers: SlabBufferPool,
        config: &TlsDriverConfig,
        tasks: Option<Arc<TaskPool>>,
    ) -> Result<Self, TlsError> {
        config.validate()?;
        let policy = match mode {
            SessionMode::Client => config.client_tasks,
            SessionMode::Server => config.server_tasks,
        };
        let dispatch = match (policy, tasks) {
            (DelegatedTaskPolicy::Inline, _) => TaskDispatch::Inline,
            (DelegatedTaskPolicy::Pool, Some(pool)) => TaskDispatch::Pool(pool),
            (DelegatedTaskPolicy::Pool, None) => {
                TaskDispatch::Pool(Arc::new(TaskPool::for_config(config)?))
            }
        };
        debug!(?mode, tasks = ?dispatch, "创建 TLS 连接");
        let session = TlsSession::new(engine, mode, buffers, dispatch)
            .with_accumulation_limit(config.max_accumulation_bytes);
        Ok(Self::new(session, socket))
    }

    pub fn socket(&self) -> &Arc<S> {
        &self.inner.socket
    }

    pub fn mode(&self) -> SessionMode {
        self.inner.core.lock().session.mode()
    }

    pub fn begin_handshake(&self) {
        self.run(|core| core.session.begin_handshake());
    }

    /// 由写出完成或委托任务完成触发，继续推进尚未完成的握手。
    pub fn resume_handshake(&self) {
        self.run(|core| core.session.resume_handshake());
    }

    /// 登记握手完成回调；握手已完成时在当前线程立即执行。
    pub fn on_handshake_complete(&self, callback: impl FnOnce() + Send + 'static) {
        let ready = self
            .inner
            .core
            .lock()
            .session
            .register_completion(Box::new(callback));
        if let Some(callback) = ready {
            callback();
        }
    }

    pub fn has_handshake_begun(&self) -> bool {
        self.inner.core.lock().session.has_handshake_begun()
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.inner.core.lock().session.is_handshake_complete()
    }

    pub fn is_handshaking(&self) -> bool {
        self.inner.core.lock().session.is_handshaking()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.inner.core.lock().session.handshake_state()
    }

    pub fn is_waiting_for_unwrap(&self) -> bool {
        self.inner.core.lock().session.is_waiting_for_unwrap()
    }

    pub fn has_initiated_close(&self) -> bool {
        self.inner.core.lock().session.has_initiated_close()
    }

    /// 在持锁状态下读取会话，用于查询协商结果或诊断信息。
    pub fn with_session<R>(&self, inspect: impl FnOnce(&TlsSession<E>) -> R) -> R {
        inspect(&self.inner.core.lock().session)
    }

    /// 处理一次原始读事件，返回解出的非空明文块数。
    pub fn on_read(&self, raw: &mut BytesMut, requests: &mut dyn ReadRequests) -> usize {
        self.run(|core| core.decryptor.on_read(&mut core.session, raw, requests))
    }

    /// 请求供给钩子：优先提供待处理队列中的明文。
    pub fn next_pending(&self, requests: &mut dyn ReadRequests) -> PendingSupply {
        self.run(|core| core.decryptor.supply(requests))
    }

    pub fn pending_decrypted(&self) -> usize {
        self.inner.core.lock().decryptor.pending_len()
    }

    /// 加密并写出应用数据，写出完成后调用 `on_complete`。
    pub fn write(
        &self,
        plaintext: &[u8],
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<(), TlsError> {
        self.run(|core| {
            let Core {
                session, encryptor, ..
            } = core;
            encryptor.write(session, plaintext, Box::new(on_complete))
        })
    }

    /// 发起关闭握手，语义同 [`TlsSession::close_ssl`]。
    pub fn close_ssl(&self, reason: DisconnectReason) -> bool {
        self.run(|core| core.session.close_ssl(reason))
    }

    /// 强制关闭：会话立即关闭并请求关闭底层套接字，随后的 [`Self::pre_close`] 不再进行关闭握手。
    pub fn force_closure(&self) {
        self.run(|core| {
            if mem::replace(&mut core.force_closure, true) {
                return;
            }
            core.session.force_closure();
            core.session
                .push_event(SessionEvent::Shutdown(DisconnectReason::LocalClose));
        });
    }

    /// 套接字关闭前的钩子；返回 `true` 表示可以立即关闭。
    pub fn pre_close(&self, reason: DisconnectReason) -> bool {
        self.run(|core| core.force_closure || core.session.close_ssl(reason))
    }

    fn run<R>(&self, op: impl FnOnce(&mut Core<E>) -> R) -> R {
        let result = {
            let mut core = self.inner.core.lock();
            let result = op(&mut core);
            let events = core.session.take_events();
            if !events.is_empty() {
                self.inner.outbox.lock().events.extend(events);
            }
            result
        };
        self.drain();
        result
    }

    fn drain(&self) {
        {
            let mut outbox = self.inner.outbox.lock();
            if outbox.draining || outbox.events.is_empty() {
                return;
            }
            outbox.draining = true;
        }
        let _guard = DrainGuard(&self.inner.outbox);
        loop {
            let next = {
                let mut outbox = self.inner.outbox.lock();
                match outbox.events.pop_front() {
                    Some(event) => event,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };
            self.dispatch(next);
        }
    }

    fn dispatch(&self, event: SessionEvent) {
        let socket = &self.inner.socket;
        match event {
            SessionEvent::Transmit { ciphertext, origin } => {
                let done: WriteDone = match origin {
                    TransmitOrigin::Application(callback) => Box::new(move |lease| {
                        drop(lease);
                        callback();
                    }),
                    TransmitOrigin::Handshake => {
                        let target = Arc::downgrade(&self.inner);
                        Box::new(move |lease| {
                            drop(lease);
                            if let Some(inner) = target.upgrade() {
                                TlsConnection { inner }.resume_handshake();
                            }
                        })
                    }
                };
                socket.write(ciphertext, done);
            }
            SessionEvent::Shutdown(reason) => socket.close(reason),
            SessionEvent::Fault(error) => {
                warn!(code = error.code(), %error, "TLS 会话故障");
                socket.report_error(error);
            }
            SessionEvent::Notify(callbacks) => {
                for callback in callbacks {
                    callback();
                }
            }
        }
    }
}

impl<E: TlsEngine, S: SocketIo> fmt::Debug for TlsConnection<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.core.try_lock() {
            Some(core) => f
                .debug_struct("TlsConnection")
                .field("session", &core.session)
                .field("force_closure", &core.force_closure)
                .finish(),
            None => f
                .debug_struct("TlsConnection")
                .finish_non_exhaustive(),
        }
    }
}
