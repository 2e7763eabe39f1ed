use spark_buffer::PooledBuffer;
use tracing::{debug, error, trace};

use super::{CloseState, HandshakeState, Step, TlsSession};
use crate::{
    engine::{EngineStatus, TlsEngine},
    error::TlsError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Wrap,
    Unwrap,
}

impl<E: TlsEngine> TlsSession<E> {
    /// 把 `src` 全部包装为密文。
    ///
    /// 目标租约按包尺寸申请；溢出时换用更大的租约并保留已产出的密文，
    /// 从 `src` 未消费的部分继续。
    pub(crate) fn execute_wrap(&mut self, src: &[u8]) -> Step {
        if self.close == CloseState::Closed {
            return Step::Aborted;
        }
        let mut dst = self.pool.acquire(self.engine.packet_buffer_size());
        let mut offset = 0;
        loop {
            let result = match self.engine.wrap(&src[offset..], dst.spare_mut()) {
                Ok(result) => result,
                Err(error) => {
                    debug!(mode = ?self.mode, %error, "wrap 失败");
                    self.fault(error.into());
                    return Step::Aborted;
                }
            };
            trace!(status = ?result.status, consumed = result.consumed, produced = result.produced, "wrap");
            offset += result.consumed;
            match result.status {
                EngineStatus::Ok => {
                    if let Err(error) = dst.commit(result.produced) {
                        self.fault(error.into());
                        return Step::Aborted;
                    }
                    let progressed = result.consumed > 0 || result.produced > 0;
                    if offset >= src.len() || !progressed {
                        return Step::Produced(dst);
                    }
                }
                EngineStatus::BufferOverflow => dst = self.enlarge(dst),
                EngineStatus::BufferUnderflow => {
                    error!(mode = ?self.mode, "wrap 返回 BUFFER_UNDERFLOW，引擎状态不可信");
                    self.fault(TlsError::UnderflowOnWrap);
                    return Step::Aborted;
                }
                EngineStatus::Closed => {
                    if let Err(error) = dst.commit(result.produced) {
                        self.fault(error.into());
                        return Step::Aborted;
                    }
                    self.on_engine_closed(Direction::Wrap);
                    return Step::Produced(dst);
                }
            }
        }
    }

    /// 从累积区拆出一条记录。
    ///
    /// 累积区不足一条记录时按需扩容到包尺寸，握手期间标记等待输入，返回 [`Step::Pending`]。
    pub(crate) fn execute_unwrap(&mut self) -> Step {
        if self.close == CloseState::Closed {
            return Step::Aborted;
        }
        self.accumulation_mut();
        let mut dst = self.pool.acquire(self.engine.application_buffer_size());
        loop {
            let Some(accumulation) = self.accumulation.as_mut() else {
                return Step::Aborted;
            };
            let result = match self.engine.unwrap(accumulation.readable(), dst.spare_mut()) {
                Ok(result) => result,
                Err(error) => {
                    debug!(mode = ?self.mode, %error, "unwrap 失败");
                    self.fault(error.into());
                    return Step::Aborted;
                }
            };
            trace!(status = ?result.status, consumed = result.consumed, produced = result.produced, "unwrap");
            if let Err(error) = accumulation.consume(result.consumed) {
                self.fault(error.into());
                return Step::Aborted;
            }
            match result.status {
                EngineStatus::Ok => {
                    accumulation.compact();
                    if let Err(error) = dst.commit(result.produced) {
                        self.fault(error.into());
                        return Step::Aborted;
                    }
                    return Step::Produced(dst);
                }
                EngineStatus::BufferOverflow => dst = self.enlarge(dst),
                EngineStatus::BufferUnderflow => {
                    accumulation.compact();
                    if let Err(error) = self.grow_accumulation() {
                        self.fault(error);
                        return Step::Aborted;
                    }
                    if self.handshake == HandshakeState::InProgress {
                        self.waiting_for_unwrap = true;
                    }
                    trace!(mode = ?self.mode, buffered = self.buffered_ciphertext(), "密文不足一条完整记录");
                    return Step::Pending;
                }
                EngineStatus::Closed => {
                    accumulation.compact();
                    if let Err(error) = dst.commit(result.produced) {
                        self.fault(error.into());
                        return Step::Aborted;
                    }
                    self.on_engine_closed(Direction::Unwrap);
                    return Step::Produced(dst);
                }
            }
        }
    }

    /// 目标缓冲溢出：新容量为旧容量加上已写入字节数，未写入任何字节时翻倍。
    fn enlarge(&mut self, dst: PooledBuffer) -> PooledBuffer {
        let written = dst.len();
        let extra = if written == 0 {
            dst.capacity().max(1)
        } else {
            written
        };
        let capacity = dst.capacity() + extra;
        debug!(from = dst.capacity(), to = capacity, "目标缓冲不足，扩容后重试");
        let mut grown = self.pool.acquire(capacity);
        grown.put_slice(dst.readable());
        grown
    }

    /// 累积区小于一个完整包时扩容到包尺寸，保留未读内容。
    fn grow_accumulation(&mut self) -> Result<(), TlsError> {
        let required = self.engine.packet_buffer_size();
        let Some(current) = self.accumulation.as_ref() else {
            return Ok(());
        };
        if current.capacity() >= required {
            return Ok(());
        }
        if let Some(limit) = self.accumulation_limit
            && required > limit
        {
            return Err(TlsError::AccumulationLimit { required, limit });
        }
        let mut grown = self.pool.acquire(required);
        grown.put_slice(current.readable());
        debug!(mode = ?self.mode, from = current.capacity(), to = required, "扩容密文累积区");
        self.accumulation = Some(grown);
        self.accumulation_growths += 1;
        Ok(())
    }

    /// 引擎报告某个方向已关闭后的状态迁移。
    fn on_engine_closed(&mut self, direction: Direction) {
        if self.close == CloseState::Open {
            debug!(mode = ?self.mode, ?direction, "引擎报告关闭，进入关闭流程");
            self.close = CloseState::ClosingLocal;
        }
        let outbound_done = self.engine.is_outbound_done();
        if outbound_done {
            self.engine.close_outbound();
        }
        if !self.engine.is_inbound_done() {
            return;
        }
        if let Err(error) = self.engine.close_inbound() {
            self.fault(error.into());
        }
        if !outbound_done {
            // 对端先关闭：回送本端 close_notify。
            self.drive_handshake();
            return;
        }
        debug!(mode = ?self.mode, "TLS 双向关闭完成");
        self.close = CloseState::Closed;
        self.waiting_for_unwrap = false;
        self.release_accumulation();
        // wrap 方向的关闭报文尚在返回途中，由握手驱动在排队写出之后请求关闭。
        if direction == Direction::Unwrap {
            self.request_shutdown();
        }
    }
}
