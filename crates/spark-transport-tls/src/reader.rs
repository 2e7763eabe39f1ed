use std::collections::VecDeque;

use bytes::BytesMut;
use spark_buffer::PooledBuffer;
use tracing::trace;

use crate::{engine::TlsEngine, session::TlsSession};

/// 上层读请求匹配层。
///
/// `deliver` 通过推进读游标消费解密数据的前缀；未消费的剩余部分会被保留，
/// 并在下一次请求时优先提供。
pub trait ReadRequests {
    fn deliver(&mut self, decrypted: &mut PooledBuffer);

    /// 待解密队列为空时的“无数据”信号。
    fn no_data(&mut self) {}
}

/// 请求供给钩子的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSupply {
    /// 队首缓冲已提供给请求方；`remaining` 为该缓冲剩余未消费的字节数。
    Delivered { remaining: usize },
    /// 队列为空，已发出“无数据”信号。
    Empty,
}

/// 记录解密器：把原始读事件喂给会话，并把解出的明文转交读请求层。
///
/// # 契约（What）
/// - 握手尚未开始，或握手进行中但并未等待输入时，只把字节并入累积区，不做解密；
/// - 否则反复解密直到没有完整记录或入站方向关闭；
/// - 未被完全消费的明文按 FIFO 进入待处理队列，队列非空时新明文直接排队，保证交付顺序。
#[derive(Debug, Default)]
pub struct RecordDecryptor {
    pending: VecDeque<PooledBuffer>,
}

impl RecordDecryptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 处理一次原始读事件，返回本次解出的非空明文块数。
    pub fn on_read<E: TlsEngine>(
        &mut self,
        session: &mut TlsSession<E>,
        raw: &mut BytesMut,
        requests: &mut dyn ReadRequests,
    ) -> usize {
        if !session.has_handshake_begun()
            || (session.is_handshaking() && !session.is_waiting_for_unwrap())
        {
            session.fill_read_buffer(raw);
            trace!(buffered = session.buffered_ciphertext(), "握手未就绪，暂存入站密文");
            return 0;
        }

        let mut decrypted = 0;
        loop {
            session.fill_read_buffer(raw);
            let backlog = session.buffered_ciphertext();
            match session.decrypt() {
                Some(plaintext) if !plaintext.is_empty() => {
                    decrypted += 1;
                    self.forward(plaintext, requests);
                }
                Some(_) => {
                    if session.buffered_ciphertext() >= backlog && !session.can_absorb(raw) {
                        break;
                    }
                }
                None => {
                    if !session.can_absorb(raw) {
                        break;
                    }
                }
            }
            if session.is_inbound_done() || !session.has_handshake_begun() {
                break;
            }
        }
        decrypted
    }

    /// 请求供给钩子：优先从待处理队列取数据，队列为空时发出“无数据”信号。
    pub fn supply(&mut self, requests: &mut dyn ReadRequests) -> PendingSupply {
        let Some(head) = self.pending.front_mut() else {
            requests.no_data();
            return PendingSupply::Empty;
        };
        requests.deliver(head);
        let remaining = head.len();
        if remaining == 0 {
            self.pending.pop_front();
        }
        PendingSupply::Delivered { remaining }
    }

    /// 待处理队列中的缓冲数量。
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn forward(&mut self, mut plaintext: PooledBuffer, requests: &mut dyn ReadRequests) {
        if self.pending.is_empty() {
            requests.deliver(&mut plaintext);
        }
        if !plaintext.is_empty() {
            self.pending.push_back(plaintext);
        }
    }
}
