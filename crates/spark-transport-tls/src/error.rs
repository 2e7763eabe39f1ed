use std::{borrow::Cow, io};

use rustls::{AlertDescription, Error as RustlsError};
use spark_buffer::BufferError;
use thiserror::Error;

/// TLS 会话驱动的错误映射模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎故障、调用时序错误、资源上限三类问题需要走不同的处置路径：
///   引擎故障经套接字的错误通道上报且会话保持打开，时序错误直接返回给调用方；
/// - 提供稳定错误码（`spark.transport.tls.*`）与粗粒度分类 [`ErrorClass`]，
///   使运维脚本能够根据错误定位问题，而无需解析底层库细节。
///
/// ## 逻辑（How）
/// - [`EngineError`] 描述 TLS 引擎能力层（`wrap`/`unwrap`/关闭）返回的故障；
/// - [`TlsError`] 是驱动层对外的唯一错误类型，`code()` 与 `class()` 由变体推导；
/// - `classify_rustls_error`/`classify_alert` 将 rustls 错误细分为安全、协议或资源类别。
///
/// ## 风险与权衡（Trade-offs）
/// - `rustls::Error::General` 等泛型错误默认映射为协议类别，避免误判为安全事件；
/// - 未穷举的 Alert 视作协议错误，后续若需更精确分类可在此集中扩展。
#[derive(Debug, Error)]
pub enum EngineError {
    /// rustls 在处理记录或握手消息时返回的错误。
    #[error("TLS 协议处理失败: {0}")]
    Rustls(#[from] RustlsError),
    /// 引擎内部读写缓冲失败。
    #[error("TLS 引擎缓冲读写失败: {0}")]
    Io(#[from] io::Error),
    /// 记录头声明的长度超出协议上限。
    #[error("TLS 记录声明长度 {declared} 超出上限 {limit}")]
    RecordOverflow { declared: usize, limit: usize },
    /// 对端发送了当前阶段不允许的消息。
    #[error("TLS 握手报文非法: {0}")]
    Protocol(Cow<'static, str>),
    /// 引擎不支持在握手完成后重新协商。
    #[error("TLS 引擎不支持重新协商")]
    RenegotiationUnsupported,
    /// 在收到对端 close_notify 之前关闭入站方向，可能遭遇截断攻击。
    #[error("入站方向在收到对端 close_notify 之前被关闭")]
    TruncatedClose,
}

/// 驱动层错误。
#[derive(Debug, Error)]
pub enum TlsError {
    /// 引擎在 wrap/unwrap/握手初始化过程中失败。
    #[error("TLS 引擎故障: {0}")]
    Engine(#[from] EngineError),
    /// 握手完成之前尝试写入应用数据。
    #[error("握手尚未完成，拒绝写入应用数据")]
    HandshakeIncomplete,
    /// wrap 返回缓冲不足，属于引擎契约违规。
    #[error("wrap 不应返回 BUFFER_UNDERFLOW")]
    UnderflowOnWrap,
    /// 会话已强制关闭。
    #[error("TLS 会话已关闭")]
    SessionClosed,
    /// 密文累积区扩容超过配置上限。
    #[error("密文累积区需要 {required} 字节，超过上限 {limit} 字节")]
    AccumulationLimit { required: usize, limit: usize },
    /// 租约游标越界，说明引擎报告的消费/产出字节数不可信。
    #[error("缓冲租约游标越界: {0}")]
    Buffer(#[from] BufferError),
    /// 配置解析或校验失败。
    #[error("TLS 驱动配置无效: {0}")]
    Config(Cow<'static, str>),
    /// 委托任务线程池不可用。
    #[error("委托任务线程池不可用: {0}")]
    TaskPool(Cow<'static, str>),
}

/// 错误的粗粒度分类，供上层决定告警、关闭或重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 证书、完整性等安全相关失败。
    Security,
    /// 报文或状态机层面的协议错误。
    Protocol,
    /// 调用方违反使用时序。
    Usage,
    /// 内存、线程等资源受限。
    Resource,
}

impl TlsError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TlsError::Engine(EngineError::TruncatedClose) => "spark.transport.tls.truncated_close",
            TlsError::Engine(_) => "spark.transport.tls.engine_failed",
            TlsError::HandshakeIncomplete => "spark.transport.tls.handshake_incomplete",
            TlsError::UnderflowOnWrap => "spark.transport.tls.wrap_underflow",
            TlsError::SessionClosed => "spark.transport.tls.session_closed",
            TlsError::AccumulationLimit { .. } => "spark.transport.tls.accumulation_limit",
            TlsError::Buffer(_) => "spark.transport.tls.buffer_misuse",
            TlsError::Config(_) => "spark.transport.tls.invalid_config",
            TlsError::TaskPool(_) => "spark.transport.tls.task_pool_unavailable",
        }
    }

    /// 返回错误分类。
    pub fn class(&self) -> ErrorClass {
        match self {
            TlsError::Engine(EngineError::Rustls(error)) => classify_rustls_error(error),
            TlsError::Engine(EngineError::TruncatedClose) => ErrorClass::Security,
            TlsError::Engine(EngineError::Io(_)) => ErrorClass::Resource,
            TlsError::Engine(_) | TlsError::UnderflowOnWrap | TlsError::Buffer(_) => {
                ErrorClass::Protocol
            }
            TlsError::HandshakeIncomplete | TlsError::SessionClosed | TlsError::Config(_) => {
                ErrorClass::Usage
            }
            TlsError::AccumulationLimit { .. } | TlsError::TaskPool(_) => ErrorClass::Resource,
        }
    }
}

fn classify_rustls_error(error: &RustlsError) -> ErrorClass {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord
        | NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType
        | NoApplicationProtocol => ErrorClass::Security,
        FailedToGetCurrentTime | FailedToGetRandomBytes | BadMaxFragmentSize => {
            ErrorClass::Resource
        }
        AlertReceived(alert) => classify_alert(alert),
        _ => ErrorClass::Protocol,
    }
}

fn classify_alert(alert: &AlertDescription) -> ErrorClass {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateRequired
        | AccessDenied
        | DecryptError
        | DecryptionFailed
        | BadRecordMac
        | InsufficientSecurity
        | InappropriateFallback => ErrorClass::Security,
        DecompressionFailure | RecordOverflow => ErrorClass::Resource,
        _ => ErrorClass::Protocol,
    }
}
