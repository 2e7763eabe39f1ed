//! `spark-buffer` 提供 TLS 会话驱动所需的池化缓冲租约。
//!
//! # 模块定位（Why）
//! - 会话驱动在 wrap/unwrap 过程中频繁申请“按协商尺寸定长”的缓冲，并在溢出时丢弃重来；
//!   若每次都走堆分配，握手与小包加解密会产生明显抖动。
//! - 租约必须在**所有退出路径**上归还（成功、溢出重试、错误、调用方放弃），
//!   因此回收动作绑定在 `Drop` 上，而不是依赖调用方手工释放。
//!
//! # 设计概要（How）
//! - `pool` 模块实现 [`SlabBufferPool`]，以 `spin::Mutex<Vec<BytesMut>>` 维护自由链表并记录统计；
//! - `pooled_buffer` 模块实现 [`PooledBuffer`]：定长、带读写游标的独占租约，
//!   在 `Drop` 阶段通过 [`BufferRecycler`] 通知所属池归还容量；
//! - 所有公开类型均满足 `Send + 'static`，可在套接字线程与任务线程之间移交。
//!
//! # 命名约定（Consistency）
//! - “可读区”指 `[read, write)`，“空闲区”指 `[write, capacity)`，与 `bytes` 的
//!   `remaining`/`remaining_mut` 语义对应。

mod error;
mod pool;
mod pooled_buffer;

pub use error::BufferError;
pub use pool::{PoolStats, SlabBufferPool};
pub use pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};
