use std::io::{Read, Write};

use rustls::Connection;
use tracing::{debug, warn};

use super::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
use crate::error::EngineError;

const RECORD_HEADER_LEN: usize = 5;
/// 密文记录负载上限：明文 2^14 加上加密扩展的 2048 字节。
const MAX_CIPHERTEXT_PAYLOAD: usize = 16_384 + 2_048;

/// 单条密文记录的最大尺寸（含记录头）。
pub const PACKET_BUFFER_SIZE: usize = RECORD_HEADER_LEN + MAX_CIPHERTEXT_PAYLOAD;
/// 单条记录可承载的最大明文尺寸。
pub const APPLICATION_BUFFER_SIZE: usize = 16_384;

/// 以 wrap/unwrap 协议驱动 `rustls::Connection` 的引擎适配器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - rustls 自身是“缓冲式”状态机：`read_tls` 吞入任意字节、`write_tls` 吐出任意字节；
///   会话驱动却需要“每次调用一条记录、目标缓冲不足即报告溢出”的显式协议，
///   适配器负责在两种模型之间转换。
///
/// ## 逻辑（How）
/// - `unwrap` 先解析记录头，只把**一条完整记录**交给 `read_tls`，不足则返回 `BufferUnderflow`
///   且不消费任何字节，从而让驱动负责累积与扩容；
/// - `wrap` 把 rustls 待发送的密文暂存在 `staged` 中，目标切片放不下时报告 `BufferOverflow`，
///   暂存内容留待下一次（扩容后的）调用整体拷出；
/// - 对端 close_notify 被处理后，握手状态报告 `NeedWrap`，驱动据此回送本端 close_notify。
///
/// ## 契约（What）
/// - 连接角色在构造时确定，[`TlsEngine::set_client_mode`] 只做一致性检查；
/// - 握手完成后再次 `begin_handshake` 返回 [`EngineError::RenegotiationUnsupported`]；
/// - rustls 不产生委托任务，`delegated_task` 恒为 `None`。
pub struct RustlsEngine {
    conn: Connection,
    staged: Vec<u8>,
    began: bool,
    peer_closed: bool,
    inbound_closed: bool,
    outbound_closed: bool,
}

impl RustlsEngine {
    pub fn new(conn: impl Into<Connection>) -> Self {
        Self {
            conn: conn.into(),
            staged: Vec::new(),
            began: false,
            peer_closed: false,
            inbound_closed: false,
            outbound_closed: false,
        }
    }

    /// 底层 rustls 连接，用于读取协商结果（ALPN、协议版本等）。
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn is_client(&self) -> bool {
        matches!(self.conn, Connection::Client(_))
    }

    fn stage_outgoing(&mut self) -> Result<(), EngineError> {
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut self.staged)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

impl TlsEngine for RustlsEngine {
    fn set_client_mode(&mut self, client: bool) {
        if client != self.is_client() {
            warn!(
                requested_client = client,
                "rustls 连接的角色在构造时确定，忽略模式切换"
            );
        }
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        if self.began && !self.conn.is_handshaking() {
            return Err(EngineError::RenegotiationUnsupported);
        }
        self.began = true;
        Ok(())
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if !self.staged.is_empty() || self.conn.wants_write() {
            return HandshakeStatus::NeedWrap;
        }
        if self.peer_closed && !self.outbound_closed {
            return HandshakeStatus::NeedWrap;
        }
        if self.conn.is_handshaking() && !self.is_inbound_done() && !self.outbound_closed {
            return HandshakeStatus::NeedUnwrap;
        }
        HandshakeStatus::NotHandshaking
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if self.peer_closed && !self.outbound_closed {
            self.close_outbound();
        }
        let mut consumed = 0;
        if !src.is_empty() && !self.outbound_closed {
            consumed = self.conn.writer().write(src)?;
        }
        self.stage_outgoing()?;
        if self.staged.len() > dst.len() {
            return Ok(EngineResult::overflow(consumed));
        }
        let produced = self.staged.len();
        dst[..produced].copy_from_slice(&self.staged);
        self.staged.clear();
        let status = if self.outbound_closed {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        let mut state = self.conn.process_new_packets()?;
        let mut consumed = 0;
        if state.plaintext_bytes_to_read() == 0 && !state.peer_has_closed() && !self.inbound_closed
        {
            let Some(record_len) = complete_record(src)? else {
                return Ok(EngineResult::underflow());
            };
            let mut record = &src[..record_len];
            while !record.is_empty() {
                let read = self.conn.read_tls(&mut record)?;
                if read == 0 {
                    break;
                }
                consumed += read;
            }
            state = self.conn.process_new_packets()?;
        }

        let pending = state.plaintext_bytes_to_read();
        if pending > dst.len() {
            return Ok(EngineResult::overflow(consumed));
        }
        if pending > 0 {
            self.conn.reader().read_exact(&mut dst[..pending])?;
            return Ok(EngineResult::new(EngineStatus::Ok, consumed, pending));
        }
        if state.peer_has_closed() || self.inbound_closed {
            if !self.peer_closed && state.peer_has_closed() {
                debug!("rustls 收到对端 close_notify");
            }
            self.peer_closed |= state.peer_has_closed();
            return Ok(EngineResult::new(EngineStatus::Closed, consumed, 0));
        }
        Ok(EngineResult::new(EngineStatus::Ok, consumed, 0))
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
        if !self.outbound_closed {
            self.conn.send_close_notify();
            self.outbound_closed = true;
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.peer_closed || self.inbound_closed
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && self.staged.is_empty() && !self.conn.wants_write()
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn packet_buffer_size(&self) -> usize {
        PACKET_BUFFER_SIZE
    }

    fn application_buffer_size(&self) -> usize {
        APPLICATION_BUFFER_SIZE
    }
}

/// 若 `src` 以一条完整记录开头，返回该记录的总长度。
fn complete_record(src: &[u8]) -> Result<Option<usize>, EngineError> {
    let Some(header) = src.get(..RECORD_HEADER_LEN) else {
        return Ok(None);
    };
    let declared = usize::from(u16::from_be_bytes([header[3], header[4]]));
    if declared > MAX_CIPHERTEXT_PAYLOAD {
        return Err(EngineError::RecordOverflow {
            declared,
            limit: MAX_CIPHERTEXT_PAYLOAD,
        });
    }
    let total = RECORD_HEADER_LEN + declared;
    Ok((src.len() >= total).then_some(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_header_is_incomplete() {
        assert_eq!(complete_record(&[0x16, 0x03]).expect("解析记录头"), None);
    }

    #[test]
    fn record_length_comes_from_header() {
        let mut record = vec![0x17, 0x03, 0x03, 0x00, 0x04];
        assert_eq!(complete_record(&record).expect("解析记录头"), None);
        record.extend_from_slice(&[1, 2, 3, 4, 0x17]);
        assert_eq!(complete_record(&record).expect("解析记录头"), Some(9));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let header = [0x17, 0x03, 0x03, 0xFF, 0xFF];
        assert!(matches!(
            complete_record(&header),
            Err(EngineError::RecordOverflow { declared: 0xFFFF, .. })
        ));
    }
}
