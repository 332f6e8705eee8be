use gpuarr_dtype::ScalarDType;

use crate::allocator::Allocator;
use crate::test::helpers::{BudgetAllocator, download, tracked_cpu};
use crate::{Acquisition, Error, PoolKey, SharedPool};

fn key(id: u64) -> PoolKey {
    PoolKey::new(id).unwrap()
}

#[test]
fn test_pool_key_zero_is_reserved() {
    assert_eq!(PoolKey::new(0), None);
    assert_eq!(key(42).get(), 42);
    assert_eq!(key(7).to_string(), "7");
}

#[test]
fn test_acquire_fresh_then_reused() {
    let pool = SharedPool::new(tracked_cpu());

    let (mut first, acquisition) = pool.acquire(key(1), ScalarDType::Float32, vec![4]).unwrap();
    assert_eq!(acquisition, Acquisition::Fresh);
    first.copyin(bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0])).unwrap();

    let (second, acquisition) = pool.acquire(key(1), ScalarDType::Float32, vec![4]).unwrap();
    assert_eq!(acquisition, Acquisition::Reused);
    assert!(second.shares_allocation(&first));
    assert_eq!(download::<f32>(&second), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_distinct_keys_distinct_buffers() {
    let pool = SharedPool::new(tracked_cpu());
    let (a, _) = pool.acquire(key(1), ScalarDType::Int32, vec![2]).unwrap();
    let (b, acquisition) = pool.acquire(key(2), ScalarDType::Int32, vec![2]).unwrap();

    assert!(acquisition.is_fresh());
    assert!(!a.shares_allocation(&b));
    assert_eq!(pool.len(), 2);
}

#[test]
fn test_slot_expires_with_last_handle() {
    let alloc = tracked_cpu();
    let pool = SharedPool::new(alloc.clone());
    {
        let (_buffer, _) = pool.acquire(key(3), ScalarDType::Int64, vec![8]).unwrap();
        assert!(pool.contains(key(3)));
    }

    assert!(!pool.contains(key(3)));
    assert!(pool.is_empty());
    assert_eq!(alloc.stats().outstanding_buffers(), 0);

    let (_buffer, acquisition) = pool.acquire(key(3), ScalarDType::Int64, vec![8]).unwrap();
    assert_eq!(acquisition, Acquisition::Fresh);
}

#[test]
fn test_retained_slot_outlives_handles() {
    let alloc = tracked_cpu();
    let pool = SharedPool::with_retention(alloc.clone(), true);
    assert!(pool.retains());
    {
        let (mut buffer, _) = pool.acquire(key(5), ScalarDType::Int32, vec![2]).unwrap();
        buffer.copyin(bytemuck::cast_slice(&[9i32, 8])).unwrap();
    }

    let (buffer, acquisition) = pool.acquire(key(5), ScalarDType::Int32, vec![2]).unwrap();
    assert_eq!(acquisition, Acquisition::Reused);
    assert_eq!(download::<i32>(&buffer), vec![9, 8]);
    drop(buffer);

    assert_eq!(alloc.stats().outstanding_buffers(), 1);
    pool.clear();
    assert_eq!(alloc.stats().outstanding_buffers(), 0);
}

#[test]
fn test_release_keeps_live_handles_valid() {
    let pool = SharedPool::new(tracked_cpu());
    let (buffer, _) = pool.acquire(key(9), ScalarDType::Float64, vec![1]).unwrap();

    assert!(pool.release(key(9)));
    assert!(!pool.release(key(9)));
    assert!(buffer.is_allocated());

    let (other, acquisition) = pool.acquire(key(9), ScalarDType::Float64, vec![1]).unwrap();
    assert!(acquisition.is_fresh());
    assert!(!other.shares_allocation(&buffer));
}

#[test]
fn test_size_mismatch_rejected() {
    let pool = SharedPool::new(tracked_cpu());
    let (_buffer, _) = pool.acquire(key(4), ScalarDType::Float32, vec![4]).unwrap();

    let result = pool.acquire(key(4), ScalarDType::Float32, vec![5]);
    assert!(matches!(result, Err(Error::PoolSlotMismatch { key: 4, expected: 16, actual: 20 })));
}

#[test]
fn test_failed_acquire_leaves_no_slot() {
    let alloc = BudgetAllocator::tracked(0);
    let pool = SharedPool::new(alloc.clone());

    let result = pool.acquire(key(1), ScalarDType::Int32, vec![16]);
    assert!(matches!(result, Err(Error::AllocationFailed { .. })));
    assert!(!pool.contains(key(1)));
    assert_eq!(alloc.stats().live_buffers, 0);
}

#[test]
fn test_dropped_slots_pruned_on_acquire() {
    let pool = SharedPool::new(tracked_cpu());
    for id in 1..=10 {
        let (buffer, _) = pool.acquire(key(id), ScalarDType::Int32, vec![2]).unwrap();
        drop(buffer);
    }
    assert_eq!(pool.slot_entries(), 1);
    assert!(pool.is_empty());

    let (held, _) = pool.acquire(key(20), ScalarDType::Int32, vec![2]).unwrap();
    let (_, acquisition) = pool.acquire(key(21), ScalarDType::Int32, vec![2]).unwrap();
    assert_eq!(acquisition, Acquisition::Fresh);
    assert_eq!(pool.slot_entries(), 2);
    assert!(pool.contains(key(20)));
    drop(held);
}
