use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

use crate::pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};

/// `SlabBufferPool` 提供基于自由链表（Free List）的缓冲池实现，
/// 专注在**每连接高频申请、定长使用**的场景下复用 `BytesMut`，减少堆分配次数。
///
/// # 模块角色（Why）
/// - 作为 TLS 会话驱动的唯一缓冲来源：wrap 目标、unwrap 目标、密文累积区都从这里租借；
/// - 借助 [`PooledBuffer`] 的 `Drop` 钩子自动回收，调用方无需关注归还细节，
///   溢出重试时“丢弃旧租约、申请更大租约”只需覆盖变量即可。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，租借时优先复用容量足够的块；
/// - 复用块会被截断并清零到**恰好** `min_capacity`，保证租约容量与请求一致，
///   调用方基于容量做的扩容判定因此是确定的；
/// - `PoolMetrics` 以原子计数跟踪分配、驻留、可用字节与活跃租约，支撑 [`Self::statistics`] 快照。
///
/// # 契约说明（What）
/// - **线程安全**：共享状态由 `spin::Mutex` 与原子计数保护，可跨线程克隆使用；
/// - **后置条件**：[`Self::acquire`] 返回的租约 `capacity() == min_capacity`，内容全部为 0，
///   读写游标均位于起点。
///
/// # 设计权衡（Trade-offs）
/// - 自旋锁临界区只包含一次线性查找与 `swap_remove`，竞争窗口极短；
/// - `shrink_to_fit` 采取“清空自由链表”的简单策略，便于在压测后快速归还峰值内存。
#[derive(Clone, Default)]
pub struct SlabBufferPool {
    inner: Arc<PoolInner>,
}

impl SlabBufferPool {
    /// 创建空池实例，供会话注入或测试场景直接使用。
    pub fn new() -> Self {
        Self::default()
    }

    /// 租借一个容量恰为 `min_capacity` 的定长缓冲。
    ///
    /// # 实现策略
    /// 1. 自由链表中存在底层容量足够的块则复用，否则新建；
    /// 2. 统一 `resize(min_capacity, 0)`，复用块不会触发重新分配；
    /// 3. 活跃租约计数加一，由租约 `Drop` 时扣减。
    pub fn acquire(&self, min_capacity: usize) -> PooledBuffer {
        let storage = self.inner.acquire_storage(min_capacity);
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        PooledBuffer::new(storage, recycler)
    }

    /// 清空自由链表并返回释放的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }

    /// 读取当前统计快照。
    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

impl std::fmt::Debug for SlabBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabBufferPool")
            .field("stats", &self.inner.snapshot())
            .finish()
    }
}

/// 缓冲池统计快照。
///
/// - `allocated_bytes`：累计向堆申请、尚未因收缩而释放的字节；
/// - `available_bytes`：自由链表中可直接复用的字节；
/// - `active_leases`：当前尚未归还的租约数量；
/// - `pool_misses`：自由链表未命中、被迫新建的次数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated_bytes: usize,
    pub resident_bytes: usize,
    pub available_bytes: usize,
    pub active_leases: usize,
    pub free_slots: usize,
    pub total_acquired: u64,
    pub total_recycled: u64,
    pub pool_misses: u64,
}

#[derive(Default)]
struct PoolInner {
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    /// 从自由链表或堆上获取一个满足容量的 `BytesMut`，并填充为定长零值区域。
    fn acquire_storage(&self, min_capacity: usize) -> BytesMut {
        let reused = {
            let mut list = self.free_list.lock();
            list.iter()
                .position(|buf| buf.capacity() >= min_capacity)
                .map(|index| list.swap_remove(index))
        };

        let mut storage = match reused {
            Some(buf) => {
                self.metrics.decrease_available(buf.capacity());
                buf
            }
            None => {
                let buf = BytesMut::with_capacity(min_capacity);
                self.metrics.increase_on_new_allocation(buf.capacity());
                self.metrics.pool_misses.fetch_add(1, Ordering::Relaxed);
                buf
            }
        };
        storage.clear();
        storage.resize(min_capacity, 0);
        self.metrics.active_leases.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_acquired.fetch_add(1, Ordering::Relaxed);
        storage
    }

    fn shrink_free_list(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed: usize = list.iter().map(BytesMut::capacity).sum();
        list.clear();
        self.metrics.decrease_on_shrink(reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let free_slots = self.free_list.lock().len();
        PoolStats {
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            resident_bytes: self.metrics.resident_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            free_slots,
            total_acquired: self.metrics.total_acquired.load(Ordering::Relaxed),
            total_recycled: self.metrics.total_recycled.load(Ordering::Relaxed),
            pool_misses: self.metrics.pool_misses.load(Ordering::Relaxed),
        }
    }
}

impl BufferRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedBuffer) {
        saturating_sub(&self.metrics.active_leases, 1);
        self.metrics.total_recycled.fetch_add(1, Ordering::Relaxed);
        let mut buf = reclaimed.into_buffer();
        // 归还前清空内容，避免明文或密钥材料残留在自由链表中。
        buf.clear();
        self.metrics.increase_available(buf.capacity());
        self.free_list.lock().push(buf);
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    resident_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
    total_acquired: AtomicU64,
    total_recycled: AtomicU64,
    pool_misses: AtomicU64,
}

impl PoolMetrics {
    fn increase_on_new_allocation(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
        self.resident_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }

    fn decrease_on_shrink(&self, capacity: usize) {
        self.decrease_available(capacity);
        saturating_sub(&self.allocated_bytes, capacity);
        saturating_sub(&self.resident_bytes, capacity);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}
