//! `pool_contract` 集成测试：验证 `SlabBufferPool` 在真实调用路径下的契约执行情况。
//!
//! # 测试目标（Why）
//! - 保障租借、`Drop` 回收、统计等核心流程能在 crate 公开 API 下正确协作；
//! - TLS 会话驱动依赖“任意退出路径都归还租约”，这里从外部视角固定该行为。
//!
//! # 结构安排（How）
//! - `every_exit_path_returns_the_lease`：覆盖正常释放、提前 `return`、panic 展开三种路径；
//! - `grow_by_replacement_keeps_single_live_lease`：模拟会话驱动的“申请更大租约 + 拷贝”扩容方式；
//! - `shrink_releases_free_list`：验证收缩后的统计一致性。

use std::panic;

use spark_buffer::SlabBufferPool;

/// 验证三种退出路径下租约均被归还。
///
/// # 步骤说明（How）
/// 1. 作用域结束自然释放；
/// 2. 函数内提前返回；
/// 3. 持有租约时 panic，并由 `catch_unwind` 捕获。
#[test]
fn every_exit_path_returns_the_lease() {
    let pool = SlabBufferPool::new();
    {
        let _lease = pool.acquire(32);
        assert_eq!(pool.statistics().active_leases, 1);
    }
    assert_eq!(pool.statistics().active_leases, 0);

    fn early_return(pool: &SlabBufferPool) -> Option<usize> {
        let lease = pool.acquire(32);
        if lease.is_empty() {
            return None;
        }
        Some(lease.len())
    }
    assert_eq!(early_return(&pool), None);
    assert_eq!(pool.statistics().active_leases, 0);

    let unwinding = pool.clone();
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(move || {
        let _lease = unwinding.acquire(32);
        panic!("模拟调用方在持有租约时崩溃");
    }));
    assert!(outcome.is_err());
    let stats = pool.statistics();
    assert_eq!(stats.active_leases, 0);
    assert_eq!(stats.total_acquired, stats.total_recycled);
}

/// 会话驱动扩容累积区时，先申请新租约、拷贝未读内容，再丢弃旧租约。
///
/// # 契约校验（What）
/// - 替换完成后活跃租约恢复为 1；
/// - 未读内容（含已消费前缀之后的部分）完整保留。
#[test]
fn grow_by_replacement_keeps_single_live_lease() {
    let pool = SlabBufferPool::new();
    let mut accumulation = pool.acquire(8);
    accumulation.put_slice(b"\x16\x03\x03\x00\x20abc");
    accumulation.consume(1).expect("消费一个字节");

    let mut grown = pool.acquire(64);
    grown.put_slice(accumulation.readable());
    accumulation = grown;

    assert_eq!(accumulation.capacity(), 64);
    assert_eq!(accumulation.readable(), b"\x03\x03\x00\x20abc");
    assert_eq!(pool.statistics().active_leases, 1);
}

#[test]
fn shrink_releases_free_list() {
    let pool = SlabBufferPool::new();
    drop(pool.acquire(128));
    drop(pool.acquire(256));
    let before = pool.statistics();
    assert_eq!(before.free_slots, 2, "第二次租借容量更大需要新建，两块均回到自由链表");
    assert_eq!(before.pool_misses, 2);

    let reclaimed = pool.shrink_to_fit();
    let after = pool.statistics();
    assert_eq!(after.free_slots, 0);
    assert_eq!(after.available_bytes, 0);
    assert_eq!(after.allocated_bytes, before.allocated_bytes - reclaimed);
}
