//! 使用 rustls 真实握手的端到端测试：证书由 rcgen 现场生成，密文在两个连接之间搬运。

use std::sync::{Arc, Once};

use rcgen::generate_simple_self_signed;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use spark_buffer::SlabBufferPool;
use spark_transport_tls::{
    DelegatedTaskPolicy, DisconnectReason, RustlsEngine, TlsConnection, TlsContext,
    TlsDriverConfig, TlsError,
    test_stubs::{Endpoint, RecordingSocket, pump},
};
use tracing_subscriber::EnvFilter;

const HOST: &str = "localhost";

/// rustls 0.23 需要进程级 `CryptoProvider`；多个测试共享一次安装，同时按 `RUST_LOG` 输出驱动日志。
fn init_test_env() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // 同进程内已有其它安装时忽略错误。
        let _ = rustls::crypto::ring::default_provider().install_default();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Pki {
    server: ServerConfig,
    client: ClientConfig,
}

fn build_pki(server_alpn: &[&[u8]], client_alpn: &[&[u8]]) -> Pki {
    init_test_env();
    let certified = generate_simple_self_signed(vec![HOST.to_owned()]).expect("生成自签名证书");
    let cert_der: CertificateDer<'static> = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .expect("构造 ServerConfig");
    server.alpn_protocols = server_alpn.iter().map(|proto| proto.to_vec()).collect();

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("信任自签名证书");
    let mut client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    client.alpn_protocols = client_alpn.iter().map(|proto| proto.to_vec()).collect();

    Pki { server, client }
}

fn driver_config() -> TlsDriverConfig {
    TlsDriverConfig {
        framework_threads: 1,
        client_tasks: DelegatedTaskPolicy::Inline,
        server_tasks: DelegatedTaskPolicy::Inline,
        ..TlsDriverConfig::default()
    }
}

fn server_name() -> ServerName<'static> {
    ServerName::try_from(HOST).expect("合法的 DNS 名称")
}

fn connect(
    server_ctx: &TlsContext<ServerConfig>,
    client_ctx: &TlsContext<ClientConfig>,
) -> (Endpoint<RustlsEngine>, Endpoint<RustlsEngine>) {
    let buffers = SlabBufferPool::new();
    let config = driver_config();
    let client = TlsConnection::client(
        client_ctx.new_engine(server_name()).expect("创建客户端引擎"),
        RecordingSocket::new(),
        buffers.clone(),
        &config,
    )
    .expect("创建客户端连接");
    let server = TlsConnection::server(
        server_ctx.new_engine().expect("创建服务端引擎"),
        RecordingSocket::new(),
        buffers,
        &config,
        None,
    )
    .expect("创建服务端连接");
    (Endpoint::new(client), Endpoint::new(server))
}

fn handshake(client: &mut Endpoint<RustlsEngine>, server: &mut Endpoint<RustlsEngine>) {
    server.connection.begin_handshake();
    client.connection.begin_handshake();
    pump(client, server);
    assert!(client.connection.is_handshake_complete(), "客户端握手应当完成");
    assert!(server.connection.is_handshake_complete(), "服务端握手应当完成");
    assert!(client.socket.error_codes().is_empty());
    assert!(server.socket.error_codes().is_empty());
}

fn contexts(pki: Pki) -> (TlsContext<ServerConfig>, TlsContext<ClientConfig>) {
    (
        TlsContext::new(Arc::new(pki.server)),
        TlsContext::new(Arc::new(pki.client)),
    )
}

#[test]
fn ping_pong_over_rustls() {
    let (server_ctx, client_ctx) = contexts(build_pki(&[], &[]));
    let (mut client, mut server) = connect(&server_ctx, &client_ctx);
    handshake(&mut client, &mut server);

    client.connection.write(b"ping", || {}).expect("客户端写入");
    pump(&mut client, &mut server);
    assert_eq!(server.reader.received, b"ping");

    server.connection.write(b"pong", || {}).expect("服务端写入");
    pump(&mut client, &mut server);
    assert_eq!(client.reader.received, b"pong");
}

#[test]
fn large_payload_spans_many_records() {
    let (server_ctx, client_ctx) = contexts(build_pki(&[], &[]));
    let (mut client, mut server) = connect(&server_ctx, &client_ctx);
    handshake(&mut client, &mut server);
    let payload: Vec<u8> = (0..100_000u32).map(|value| (value % 239) as u8).collect();

    client.connection.write(&payload, || {}).expect("客户端写入");
    let wire = client.socket.take_outbound();
    for piece in wire.chunks(1_000) {
        server.receive(piece);
    }

    assert_eq!(server.reader.received, payload);
}

#[test]
fn write_before_handshake_is_rejected() {
    let (server_ctx, client_ctx) = contexts(build_pki(&[], &[]));
    let (client, _server) = connect(&server_ctx, &client_ctx);

    let error = client
        .connection
        .write(b"too early", || {})
        .expect_err("握手完成前拒绝写入");

    assert!(matches!(error, TlsError::HandshakeIncomplete));
    assert_eq!(client.socket.write_count(), 0);
}

#[test]
fn close_notify_is_exchanged_in_both_directions() {
    let (server_ctx, client_ctx) = contexts(build_pki(&[], &[]));
    let (mut client, mut server) = connect(&server_ctx, &client_ctx);
    handshake(&mut client, &mut server);

    assert!(!client.connection.pre_close(DisconnectReason::LocalClose));
    pump(&mut client, &mut server);

    assert_eq!(client.socket.closes(), vec![DisconnectReason::LocalClose]);
    assert_eq!(server.socket.closes(), vec![DisconnectReason::RemoteClose]);
    assert!(client.socket.error_codes().is_empty());
    assert!(server.socket.error_codes().is_empty());
}

#[test]
fn renegotiation_request_is_reported() {
    let (server_ctx, client_ctx) = contexts(build_pki(&[], &[]));
    let (mut client, mut server) = connect(&server_ctx, &client_ctx);
    handshake(&mut client, &mut server);

    client.connection.begin_handshake();

    assert!(client.connection.is_handshake_complete());
    assert_eq!(
        client.socket.error_codes(),
        vec!["spark.transport.tls.engine_failed"]
    );
}

#[test]
fn replaced_context_applies_to_new_connections_only() {
    let (server_ctx, client_ctx) = contexts(build_pki(&[], &[b"h2"]));
    let (mut before_client, mut before_server) = connect(&server_ctx, &client_ctx);

    let replacement = build_pki(&[b"h2"], &[b"h2"]);
    server_ctx.replace(Arc::new(replacement.server));
    client_ctx.replace(Arc::new(replacement.client));
    let (mut after_client, mut after_server) = connect(&server_ctx, &client_ctx);

    handshake(&mut before_client, &mut before_server);
    handshake(&mut after_client, &mut after_server);

    let negotiated = |endpoint: &Endpoint<RustlsEngine>| {
        endpoint
            .connection
            .with_session(|session| session.engine().connection().alpn_protocol().map(<[u8]>::to_vec))
    };
    assert_eq!(negotiated(&before_server), None);
    assert_eq!(negotiated(&after_server), Some(b"h2".to_vec()));
    assert_eq!(negotiated(&after_client), Some(b"h2".to_vec()));
}
