use std::mem;

use tracing::{debug, info, trace, warn};

use super::{CloseState, HandshakeState, SessionEvent, Step, TaskDispatch, TlsSession, TransmitOrigin};
use crate::{
    engine::{DelegatedTask, HandshakeStatus, TlsEngine},
    error::TlsError,
};

impl<E: TlsEngine> TlsSession<E> {
    /// 握手驱动：循环执行引擎要求的动作，直到握手完成或缺少输入而挂起。
    ///
    /// - `NeedWrap`：包装空明文，产出的握手报文排队写出；若两个方向都已关闭则请求关闭套接字；
    /// - `NeedUnwrap`：消费累积区中的一条记录，输出丢弃；累积区不足一条记录时挂起并标记等待输入；
    /// - `NeedTask`：取尽委托任务，内联执行或投递线程池；
    /// - `Finished`/`NotHandshaking`：清除等待标记，首次完成时派发全部完成回调。
    ///
    /// 任何一步因故障中止、或委托任务仍在执行而无事可做时，循环挂起，等待下一次 I/O 事件。
    pub(crate) fn drive_handshake(&mut self) {
        loop {
            if self.close == CloseState::Closed {
                return;
            }
            let status = self.engine.handshake_status();
            trace!(mode = ?self.mode, ?status, "握手驱动");
            match status {
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    self.waiting_for_unwrap = false;
                    self.complete_handshake();
                    return;
                }
                HandshakeStatus::NeedWrap => {
                    let Step::Produced(ciphertext) = self.execute_wrap(&[]) else {
                        return;
                    };
                    let produced = !ciphertext.is_empty();
                    if produced {
                        self.push_event(SessionEvent::Transmit {
                            ciphertext,
                            origin: TransmitOrigin::Handshake,
                        });
                    }
                    if self.engine.is_outbound_done() && self.engine.is_inbound_done() {
                        self.request_shutdown();
                    }
                    if !produced && self.engine.handshake_status() == HandshakeStatus::NeedWrap {
                        warn!(mode = ?self.mode, "wrap 未产出握手报文，挂起握手");
                        return;
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    let before = self.buffered_ciphertext();
                    match self.execute_unwrap() {
                        Step::Produced(output) => {
                            let stalled = output.is_empty()
                                && self.buffered_ciphertext() == before
                                && self.engine.handshake_status() == HandshakeStatus::NeedUnwrap;
                            if stalled {
                                self.waiting_for_unwrap = true;
                                return;
                            }
                        }
                        Step::Pending => {
                            self.waiting_for_unwrap = true;
                            debug!(mode = ?self.mode, buffered = self.buffered_ciphertext(), "握手等待更多入站密文");
                            return;
                        }
                        Step::Aborted => return,
                    }
                }
                HandshakeStatus::NeedTask => {
                    let dispatched = self.run_delegated_tasks();
                    if dispatched == 0
                        && self.engine.handshake_status() == HandshakeStatus::NeedTask
                    {
                        debug!(mode = ?self.mode, "委托任务尚未完成，挂起握手");
                        return;
                    }
                }
            }
        }
    }

    fn complete_handshake(&mut self) {
        if self.handshake != HandshakeState::InProgress {
            return;
        }
        self.handshake = HandshakeState::Complete;
        let callbacks = mem::take(&mut self.completion_callbacks);
        info!(mode = ?self.mode, callbacks = callbacks.len(), "TLS 握手完成");
        if !callbacks.is_empty() {
            self.push_event(SessionEvent::Notify(callbacks));
        }
    }

    /// 取尽引擎的委托任务，返回本轮取出的任务数。
    fn run_delegated_tasks(&mut self) -> usize {
        let mut dispatched = 0;
        while let Some(task) = self.engine.delegated_task() {
            dispatched += 1;
            let pool = match &self.tasks {
                TaskDispatch::Inline => None,
                TaskDispatch::Pool(pool) => Some(pool.clone()),
            };
            let Some(pool) = pool else {
                task();
                continue;
            };
            let hook = self.resume_hook.clone();
            let job: DelegatedTask = Box::new(move || {
                task();
                if let Some(hook) = hook {
                    hook();
                }
            });
            if pool.try_execute(job).is_err() {
                warn!(mode = ?self.mode, "委托任务线程池已关闭，任务被丢弃");
                self.fault(TlsError::TaskPool("工作线程已全部退出".into()));
            }
        }
        if dispatched > 0 {
            trace!(mode = ?self.mode, dispatched, "委托任务已派发");
        }
        dispatched
    }
}
