use std::{fmt, mem, sync::Arc};

use bytes::BytesMut;

use crate::error::BufferError;

/// `BufferRecycler` 描述缓冲池在租借结束时的回收入口。
///
/// # 设计初衷（Why）
/// - 租约的归还必须发生在所有退出路径上，放在 [`PooledBuffer`] 的 `Drop` 中统一通知池，
///   避免在会话驱动里散落手工释放逻辑。
///
/// # 契约定义（What）
/// - **前置条件**：实现必须线程安全，且调用过程中不得 panic，
///   否则 `Drop` 路径上的 panic 将导致进程异常终止。
/// - **后置条件**：池应当已记录该容量的可用性，并可在后续租借中复用。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 通知池回收一次租约。
    fn reclaim(&self, reclaimed: ReclaimedBuffer);
}

/// 表示一次回收动作所携带的上下文。
///
/// - `capacity`：租约对外暴露的定长容量；
/// - `buffer`：底层 `BytesMut`，其真实分配容量可能大于 `capacity`（来自复用块）。
#[derive(Debug)]
pub struct ReclaimedBuffer {
    capacity: usize,
    buffer: BytesMut,
}

impl ReclaimedBuffer {
    /// 创建携带完整上下文的回收结果。
    pub fn new(capacity: usize, buffer: BytesMut) -> Self {
        Self { capacity, buffer }
    }

    /// 返回本次回收的租约容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 消耗结构并返回可复用的 `BytesMut`。
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }
}

/// `PooledBuffer`：定长、独占的缓冲租约。
///
/// # 教案级说明
///
/// ## 意图（Why）
/// - TLS 引擎的 wrap/unwrap 以“源切片 + 目标切片”工作，目标切片必须预先具备足够容量；
///   定长租约让“容量不足 → 申请更大租约重试”的判定简单而确定。
/// - 同一块内存在密文累积场景中既要追加写入又要从前端消费，因此需要独立的读写游标，
///   并支持 [`Self::compact`] 把未读内容搬回起点。
///
/// ## 结构（How）
/// - `storage` 的长度恒等于租约容量，未写区域保持为 0；
/// - `read <= write <= capacity` 始终成立，所有推进游标的操作都会先校验；
/// - `Drop` 时把 `storage` 交还给 [`BufferRecycler`]，无论调用方以何种路径放弃租约。
///
/// ## 契约（What）
/// - 租约在任意时刻只有一个所有者；移动即移交所有权，不存在共享视图；
/// - 容量在生命周期内不变，需要更大空间时由调用方申请新租约并拷贝。
pub struct PooledBuffer {
    storage: BytesMut,
    read: usize,
    write: usize,
    recycler: Arc<dyn BufferRecycler>,
}

impl PooledBuffer {
    /// 由缓冲池构造租约，`storage.len()` 即租约容量。
    pub(crate) fn new(storage: BytesMut, recycler: Arc<dyn BufferRecycler>) -> Self {
        Self {
            storage,
            read: 0,
            write: 0,
            recycler,
        }
    }

    /// 租约的定长容量。
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// 可读区长度（已写入但尚未消费的字节数）。
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    /// 可读区是否为空。
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// 已被消费的字节数，即读游标位置。
    pub fn consumed(&self) -> usize {
        self.read
    }

    /// 空闲区长度。
    pub fn spare_capacity(&self) -> usize {
        self.capacity() - self.write
    }

    /// 可读区视图 `[read, write)`。
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.read..self.write]
    }

    /// 空闲区视图 `[write, capacity)`，写入后需调用 [`Self::commit`] 确认。
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let write = self.write;
        &mut self.storage[write..]
    }

    /// 将写游标推进 `len` 字节。
    pub fn commit(&mut self, len: usize) -> Result<(), BufferError> {
        let available = self.spare_capacity();
        if len > available {
            return Err(BufferError::CommitOverflow {
                requested: len,
                available,
            });
        }
        self.write += len;
        Ok(())
    }

    /// 将读游标推进 `len` 字节。
    pub fn consume(&mut self, len: usize) -> Result<(), BufferError> {
        let available = self.len();
        if len > available {
            return Err(BufferError::ConsumeOverflow {
                requested: len,
                available,
            });
        }
        self.read += len;
        Ok(())
    }

    /// 尽可能多地追加 `data`，返回实际写入的字节数。
    pub fn put_slice(&mut self, data: &[u8]) -> usize {
        let copied = data.len().min(self.spare_capacity());
        let write = self.write;
        self.storage[write..write + copied].copy_from_slice(&data[..copied]);
        self.write += copied;
        copied
    }

    /// 把未读内容搬回起点，释放前端已消费的空间。
    pub fn compact(&mut self) {
        if self.read == 0 {
            return;
        }
        let len = self.len();
        self.storage.copy_within(self.read..self.write, 0);
        self.storage[len..self.write].fill(0);
        self.read = 0;
        self.write = len;
    }

    /// 复位两个游标并清零内容。
    pub fn clear(&mut self) {
        self.storage[..self.write].fill(0);
        self.read = 0;
        self.write = 0;
    }

    /// 复制可读区为 `Vec<u8>`，不改变游标。
    pub fn to_vec(&self) -> Vec<u8> {
        self.readable().to_vec()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let capacity = self.capacity();
        let storage = mem::take(&mut self.storage);
        self.recycler
            .reclaim(ReclaimedBuffer::new(capacity, storage));
    }
}
