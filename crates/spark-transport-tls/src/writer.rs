use tracing::trace;

use crate::{
    engine::TlsEngine,
    error::TlsError,
    session::{CompletionCallback, SessionEvent, TlsSession, TransmitOrigin},
};

/// 记录加密器：加密调用方明文并交给底层写出。
///
/// 握手完成前拒绝写入；加密失败时写入以空操作结束，故障已经通过错误通道上报。
/// 产出为空时（例如空明文）直接完成回调，不占用底层写出。
#[derive(Debug, Default)]
pub struct RecordEncryptor;

impl RecordEncryptor {
    pub fn new() -> Self {
        Self
    }

    pub fn write<E: TlsEngine>(
        &self,
        session: &mut TlsSession<E>,
        plaintext: &[u8],
        on_complete: CompletionCallback,
    ) -> Result<(), TlsError> {
        if !session.is_handshake_complete() {
            return Err(TlsError::HandshakeIncomplete);
        }
        if session.has_initiated_close() {
            return Err(TlsError::SessionClosed);
        }
        let Some(ciphertext) = session.encrypt(plaintext) else {
            trace!(len = plaintext.len(), "加密未产出结果，写入以空操作结束");
            return Ok(());
        };
        if ciphertext.is_empty() {
            session.push_event(SessionEvent::Notify(vec![on_complete]));
            return Ok(());
        }
        trace!(plaintext = plaintext.len(), ciphertext = ciphertext.len(), "排队写出应用数据");
        session.push_event(SessionEvent::Transmit {
            ciphertext,
            origin: TransmitOrigin::Application(on_complete),
        });
        Ok(())
    }
}
