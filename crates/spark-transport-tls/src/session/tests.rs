use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spark_buffer::SlabBufferPool;
use tracing_test::traced_test;

use super::*;
use crate::{
    engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus},
    error::EngineError,
    test_stubs::LoopbackEngine,
};

fn session<E: TlsEngine>(engine: E, mode: SessionMode) -> TlsSession<E> {
    TlsSession::new(engine, mode, SlabBufferPool::new(), TaskDispatch::Inline)
}

/// 取出会话排队的全部密文，其余事件原样返回。
fn drain_transmits<E: TlsEngine>(session: &mut TlsSession<E>) -> (Vec<u8>, Vec<SessionEvent>) {
    let mut wire = Vec::new();
    let mut others = Vec::new();
    for event in session.take_events() {
        match event {
            SessionEvent::Transmit { ciphertext, .. } => wire.extend_from_slice(ciphertext.readable()),
            other => others.push(other),
        }
    }
    (wire, others)
}

/// 模拟读事件：把 `bytes` 并入会话并反复解密，返回解出的明文。
fn feed<E: TlsEngine>(session: &mut TlsSession<E>, bytes: &[u8]) -> Vec<u8> {
    let mut raw = BytesMut::from(bytes);
    let mut plaintext = Vec::new();
    for _ in 0..64 {
        let absorbed = session.fill_read_buffer(&mut raw);
        match session.decrypt() {
            Some(output) => plaintext.extend_from_slice(output.readable()),
            None if raw.is_empty() || absorbed == 0 => break,
            None => {}
        }
        if session.is_inbound_done() {
            break;
        }
    }
    plaintext
}

fn fault_codes(events: &[SessionEvent]) -> Vec<&'static str> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Fault(error) => Some(error.code()),
            _ => None,
        })
        .collect()
}

fn shutdowns(events: &[SessionEvent]) -> Vec<DisconnectReason> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Shutdown(reason) => Some(*reason),
            _ => None,
        })
        .collect()
}

/// 在两个会话之间搬运握手报文直到静默。
fn handshake<C: TlsEngine, S: TlsEngine>(client: &mut TlsSession<C>, server: &mut TlsSession<S>) {
    server.begin_handshake();
    client.begin_handshake();
    for _ in 0..16 {
        let (to_server, _) = drain_transmits(client);
        let (to_client, _) = drain_transmits(server);
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        if !to_server.is_empty() {
            feed(server, &to_server);
        }
        if !to_client.is_empty() {
            feed(client, &to_client);
        }
    }
}

fn established() -> (TlsSession<LoopbackEngine>, TlsSession<LoopbackEngine>) {
    let mut client = session(LoopbackEngine::new(), SessionMode::Client);
    let mut server = session(LoopbackEngine::new(), SessionMode::Server);
    handshake(&mut client, &mut server);
    assert!(client.is_handshake_complete());
    assert!(server.is_handshake_complete());
    (client, server)
}

#[test]
fn client_begin_emits_hello_and_suspends() {
    let mut client = session(LoopbackEngine::new(), SessionMode::Client);
    assert!(!client.has_handshake_begun());

    client.begin_handshake();

    assert_eq!(client.handshake_state(), HandshakeState::InProgress);
    assert!(client.is_waiting_for_unwrap());
    let (wire, others) = drain_transmits(&mut client);
    assert_eq!(wire, [0x16u8, 0x00, 0x01, 0x01]);
    assert!(others.is_empty());
}

#[traced_test]
#[test]
fn repeated_begin_is_ignored() {
    let mut client = session(LoopbackEngine::new(), SessionMode::Client);
    client.begin_handshake();
    let (first, _) = drain_transmits(&mut client);

    client.begin_handshake();

    let (second, _) = drain_transmits(&mut client);
    assert!(!first.is_empty());
    assert!(second.is_empty());
    assert!(logs_contain("握手已在进行中"));
}

#[test]
fn handshake_completion_notifies_registered_callbacks_once() {
    let mut client = session(LoopbackEngine::new(), SessionMode::Client);
    let mut server = session(LoopbackEngine::new(), SessionMode::Server);
    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let fired = Arc::clone(&fired);
        assert!(
            client
                .register_completion(Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }))
                .is_none()
        );
    }

    server.begin_handshake();
    client.begin_handshake();
    let mut notified = 0;
    for _ in 0..8 {
        let mut to_server = Vec::new();
        for event in client.take_events() {
            match event {
                SessionEvent::Transmit { ciphertext, .. } => {
                    to_server.extend_from_slice(ciphertext.readable())
                }
                SessionEvent::Notify(callbacks) => {
                    notified += 1;
                    callbacks.into_iter().for_each(|callback| callback());
                }
                other => panic!("意外事件 {other:?}"),
            }
        }
        let (to_client, _) = drain_transmits(&mut server);
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        feed(&mut server, &to_server);
        feed(&mut client, &to_client);
    }

    assert_eq!(notified, 1);
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert!(client.completion_callbacks.is_empty());
}

#[test]
fn late_registration_hands_callback_back() {
    let (mut client, _server) = established();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);

    client.on_handshake_complete(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn ping_round_trip_after_handshake() {
    let (mut client, mut server) = established();

    let ciphertext = client.encrypt(b"ping").expect("加密应当成功");
    assert_ne!(ciphertext.readable(), b"ping");

    let plaintext = feed(&mut server, ciphertext.readable());
    assert_eq!(plaintext, b"ping");
}

#[test]
fn wrap_overflow_keeps_earlier_records() {
    let mut client = session(
        LoopbackEngine::new().with_packet_sizes(64, 32),
        SessionMode::Client,
    );
    let mut server = session(
        LoopbackEngine::new().with_packet_sizes(64, 32),
        SessionMode::Server,
    );
    handshake(&mut client, &mut server);
    let message: Vec<u8> = (0..100u8).collect();

    let ciphertext = client.encrypt(&message).expect("加密应当成功");

    // 29 字节一条记录，共 4 条，每条 3 字节头部。
    assert_eq!(ciphertext.len(), 100 + 4 * 3);
    assert_eq!(feed(&mut server, ciphertext.readable()), message);
}

#[test]
fn fragmented_record_is_reassembled() {
    let (mut client, mut server) = established();
    let ciphertext = client.encrypt(b"fragmented payload").expect("加密应当成功");

    let mut plaintext = Vec::new();
    for byte in ciphertext.readable() {
        plaintext.extend(feed(&mut server, std::slice::from_ref(byte)));
    }

    assert_eq!(plaintext, b"fragmented payload");
}

#[traced_test]
#[test]
fn accumulation_grows_to_packet_size_on_underflow() {
    let mut client = session(
        LoopbackEngine::new().with_packet_sizes(16, 256),
        SessionMode::Client,
    );
    let mut server = session(
        LoopbackEngine::new().with_packet_sizes(16, 256),
        SessionMode::Server,
    );
    handshake(&mut client, &mut server);
    assert_eq!(server.accumulation_capacity(), Some(16));
    assert_eq!(server.accumulation_growths(), 0);
    let message = vec![7u8; 200];

    let ciphertext = client.encrypt(&message).expect("加密应当成功");
    let plaintext = feed(&mut server, ciphertext.readable());

    assert_eq!(plaintext, message);
    assert_eq!(server.accumulation_growths(), 1);
    assert_eq!(server.accumulation_capacity(), Some(256));
    assert!(logs_contain("扩容密文累积区"));
}

#[test]
fn accumulation_limit_is_reported_as_fault() {
    let mut client = session(
        LoopbackEngine::new().with_packet_sizes(16, 256),
        SessionMode::Client,
    );
    let mut server = session(
        LoopbackEngine::new().with_packet_sizes(16, 256),
        SessionMode::Server,
    )
    .with_accumulation_limit(Some(128));
    handshake(&mut client, &mut server);
    drain_transmits(&mut server);

    let ciphertext = client.encrypt(&[1u8; 200]).expect("加密应当成功");
    let plaintext = feed(&mut server, ciphertext.readable());

    assert!(plaintext.is_empty());
    let (_, events) = drain_transmits(&mut server);
    assert!(fault_codes(&events).contains(&"spark.transport.tls.accumulation_limit"));
    assert_eq!(server.close_state(), CloseState::Open);
}

#[test]
fn delegated_task_runs_inline() {
    let mut client = session(LoopbackEngine::new(), SessionMode::Client);
    let mut server = session(LoopbackEngine::new().with_delegated_task(), SessionMode::Server);

    handshake(&mut client, &mut server);

    assert!(client.is_handshake_complete());
    assert!(server.is_handshake_complete());
}

#[test]
fn graceful_close_exchanges_close_notify() {
    let (mut client, mut server) = established();

    assert!(!client.close_ssl(DisconnectReason::LocalClose));
    assert_eq!(client.close_state(), CloseState::ClosingLocal);
    assert!(client.has_initiated_close());
    let (alert, events) = drain_transmits(&mut client);
    assert!(!alert.is_empty());
    assert!(shutdowns(&events).is_empty());

    feed(&mut server, &alert);
    let (reply, events) = drain_transmits(&mut server);
    assert!(!reply.is_empty());
    assert_eq!(shutdowns(&events), vec![DisconnectReason::RemoteClose]);
    assert_eq!(server.close_state(), CloseState::Closed);

    feed(&mut client, &reply);
    let (_, events) = drain_transmits(&mut client);
    assert_eq!(shutdowns(&events), vec![DisconnectReason::LocalClose]);
    assert_eq!(client.close_state(), CloseState::Closed);
    assert!(fault_codes(&events).is_empty());
}

#[test]
fn remote_close_forces_closure_without_output() {
    let (mut client, _server) = established();

    assert!(client.close_ssl(DisconnectReason::RemoteClose));

    let (wire, events) = drain_transmits(&mut client);
    assert!(wire.is_empty());
    assert_eq!(client.close_state(), CloseState::Closed);
    assert_eq!(
        fault_codes(&events),
        vec!["spark.transport.tls.truncated_close"]
    );
    assert!(client.close_ssl(DisconnectReason::LocalClose));
}

#[test]
fn closing_an_idle_session_closes_immediately() {
    let mut server = session(LoopbackEngine::new(), SessionMode::Server);

    assert!(server.close_ssl(DisconnectReason::LocalClose));
    assert_eq!(server.close_state(), CloseState::Closed);
}

#[test]
fn forced_session_ignores_further_work() {
    let (mut client, _server) = established();
    client.force_closure();
    client.take_events();

    assert!(client.encrypt(b"late").is_none());
    client.begin_handshake();
    let mut raw = BytesMut::from(&b"\x17\x00\x01x"[..]);
    assert_eq!(client.fill_read_buffer(&mut raw), 0);
    assert!(client.decrypt().is_none());
    assert_eq!(client.accumulation_capacity(), None);
    assert!(client.take_events().is_empty());
}

#[traced_test]
#[test]
fn client_renegotiation_is_followed_by_server() {
    let (mut client, mut server) = established();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    client.on_handshake_complete(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    client.begin_handshake();
    assert!(client.is_handshaking());
    for _ in 0..8 {
        let (to_server, _) = drain_transmits(&mut client);
        let (to_client, _) = drain_transmits(&mut server);
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        feed(&mut server, &to_server);
        feed(&mut client, &to_client);
    }

    assert!(client.is_handshake_complete());
    assert!(server.is_handshake_complete());
    assert!(logs_contain("对端发起重新协商"));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let ciphertext = client.encrypt(b"after").expect("加密应当成功");
    assert_eq!(feed(&mut server, ciphertext.readable()), b"after");
}

#[test]
fn rejected_begin_keeps_state_and_reports() {
    let (_client, mut server) = established();

    server.begin_handshake();

    assert_eq!(server.handshake_state(), HandshakeState::Complete);
    let (_, events) = drain_transmits(&mut server);
    assert_eq!(
        fault_codes(&events),
        vec!["spark.transport.tls.engine_failed"]
    );
}

/// 在回环引擎之上注入 wrap 故障。
struct FaultyWrap {
    inner: LoopbackEngine,
    fault: Option<WrapFault>,
}

#[derive(Clone, Copy)]
enum WrapFault {
    Underflow,
    Error,
}

impl TlsEngine for FaultyWrap {
    fn set_client_mode(&mut self, client: bool) {
        self.inner.set_client_mode(client);
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        self.inner.begin_handshake()
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.inner.handshake_status()
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        match self.fault {
            Some(WrapFault::Underflow) => Ok(EngineResult::new(EngineStatus::BufferUnderflow, 0, 0)),
            Some(WrapFault::Error) => Err(EngineError::Protocol("注入的 wrap 故障".into())),
            None => self.inner.wrap(src, dst),
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        self.inner.unwrap(src, dst)
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        self.inner.close_inbound()
    }

    fn close_outbound(&mut self) {
        self.inner.close_outbound();
    }

    fn is_inbound_done(&self) -> bool {
        self.inner.is_inbound_done()
    }

    fn is_outbound_done(&self) -> bool {
        self.inner.is_outbound_done()
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        self.inner.delegated_task()
    }

    fn packet_buffer_size(&self) -> usize {
        self.inner.packet_buffer_size()
    }

    fn application_buffer_size(&self) -> usize {
        self.inner.application_buffer_size()
    }
}

fn faulty_pair(fault: WrapFault) -> TlsSession<FaultyWrap> {
    let mut client = session(
        FaultyWrap {
            inner: LoopbackEngine::new(),
            fault: None,
        },
        SessionMode::Client,
    );
    let mut server = session(LoopbackEngine::new(), SessionMode::Server);
    handshake(&mut client, &mut server);
    assert!(client.is_handshake_complete());
    client.engine.fault = Some(fault);
    client
}

#[traced_test]
#[test]
fn underflow_on_wrap_is_logged_and_reported() {
    let mut client = faulty_pair(WrapFault::Underflow);

    assert!(client.encrypt(b"data").is_none());

    let (_, events) = drain_transmits(&mut client);
    assert_eq!(fault_codes(&events), vec!["spark.transport.tls.wrap_underflow"]);
    assert!(logs_contain("BUFFER_UNDERFLOW"));
    assert_eq!(client.close_state(), CloseState::Open);
}

#[test]
fn engine_fault_does_not_close_session() {
    let mut client = faulty_pair(WrapFault::Error);

    assert!(client.encrypt(b"data").is_none());

    let (_, events) = drain_transmits(&mut client);
    assert_eq!(fault_codes(&events), vec!["spark.transport.tls.engine_failed"]);
    assert_eq!(client.close_state(), CloseState::Open);
    assert!(client.is_handshake_complete());
}
