use gpuarr_device::{Allocator, ContextConfig, DeviceContext, SharedPool, registry::DeviceRegistry};

use crate::test::helpers::allocator;
use crate::{DeviceArray, Error, Ownership, PoolKey};

fn key(id: u64) -> PoolKey {
    PoolKey::new(id).unwrap()
}

#[test]
fn test_owned_arrays_never_share() {
    let alloc = allocator();
    let a = DeviceArray::<f32>::new(alloc.clone(), 8).unwrap();
    let b = DeviceArray::<f32>::new(alloc.clone(), 8).unwrap();

    assert_eq!(a.ownership(), Ownership::Owned);
    assert_eq!(a.ownership().id(), 0);
    assert!(!a.buffer().unwrap().shares_allocation(b.buffer().unwrap()));
    assert_eq!(alloc.stats().outstanding_buffers(), 2);
}

#[test]
fn test_owned_to_device_memory_reports_fresh() {
    let mut array = DeviceArray::<i32>::new(allocator(), 3).unwrap();
    assert!(array.is_acquired());
    assert!(array.to_device_memory().unwrap());
    assert!(array.to_device_memory().unwrap());
}

#[test]
fn test_shared_first_fresh_then_reused() {
    let pool = SharedPool::new(allocator());
    let mut first = DeviceArray::<f64, 2>::shared(&pool, key(11), 3);
    let mut second = DeviceArray::<f64, 2>::shared(&pool, key(11), 3);
    assert!(!first.is_acquired());

    assert!(first.to_device_memory().unwrap());
    first.to_device(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

    assert!(!second.to_device_memory().unwrap());
    assert_eq!(second.to_host().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert!(first.buffer().unwrap().shares_allocation(second.buffer().unwrap()));
    assert_eq!(second.ownership(), Ownership::Shared { key: key(11) });

    // Asking again keeps the same buffer.
    assert!(!first.to_device_memory().unwrap());
}

#[test]
fn test_shared_release_on_last_drop() {
    let alloc = allocator();
    let pool = SharedPool::new(alloc.clone());
    let mut first = DeviceArray::<i32>::shared(&pool, key(1), 16);
    let mut second = DeviceArray::<i32>::shared(&pool, key(1), 16);
    first.to_device_memory().unwrap();
    second.to_device_memory().unwrap();
    assert_eq!(alloc.stats().outstanding_buffers(), 1);

    drop(first);
    assert_eq!(alloc.stats().outstanding_buffers(), 1);
    assert_eq!(second.to_host().unwrap().len(), 16);

    drop(second);
    assert_eq!(alloc.stats().outstanding_buffers(), 0);
    assert!(pool.is_empty());
}

#[test]
fn test_shared_retained_between_handles() {
    let pool = SharedPool::with_retention(allocator(), true);
    {
        let mut array = DeviceArray::<i64>::shared(&pool, key(2), 2);
        assert!(array.to_device_memory().unwrap());
        array.to_device(&[40, 2]).unwrap();
    }

    let mut again = DeviceArray::<i64>::shared(&pool, key(2), 2);
    assert!(!again.to_device_memory().unwrap());
    assert_eq!(again.reduce_sum().unwrap(), 42);
}

#[test]
fn test_shared_unacquired_operations_fail() {
    let pool = SharedPool::new(allocator());
    let mut array = DeviceArray::<f32>::shared(&pool, key(3), 4);

    assert!(matches!(array.to_host(), Err(Error::NotAcquired { ownership: Ownership::Shared { .. } })));
    assert!(matches!(array.zero(), Err(Error::NotAcquired { .. })));
    assert!(matches!(array.to_device(&[0.0; 4]), Err(Error::NotAcquired { .. })));
    assert!(pool.is_empty());
}

#[test]
fn test_shared_size_mismatch() {
    let pool = SharedPool::new(allocator());
    let mut a = DeviceArray::<f32>::shared(&pool, key(4), 4);
    let mut b = DeviceArray::<f32>::shared(&pool, key(4), 5);
    a.to_device_memory().unwrap();

    assert!(matches!(
        b.to_device_memory(),
        Err(Error::Device { source: gpuarr_device::Error::PoolSlotMismatch { key: 4, .. } })
    ));
    assert!(!b.is_acquired());
}

#[test]
fn test_with_id_selects_ownership() {
    let pool = SharedPool::new(allocator());
    let owned = DeviceArray::<i32>::with_id(&pool, 0, 2).unwrap();
    let shared = DeviceArray::<i32>::with_id(&pool, 9, 2).unwrap();

    assert_eq!(owned.ownership(), Ownership::Owned);
    assert!(owned.is_acquired());
    assert_eq!(shared.ownership().id(), 9);
    assert!(!shared.is_acquired());
}

#[test]
fn test_context_constructors() {
    let registry = DeviceRegistry::new();
    let config = ContextConfig::builder().threads_per_block(16).build();
    let context = DeviceContext::init_with(&registry, &config).unwrap();

    let owned = DeviceArray::<f32>::in_context(&context, 4).unwrap();
    let mut shared = DeviceArray::<f32>::shared_in(&context, key(1), 4);
    assert!(shared.to_device_memory().unwrap());
    assert_eq!(owned.launch_config().threads_per_block, 16);
    assert_eq!(shared.launch_config().threads_per_block, 16);

    drop(owned);
    drop(shared);
    assert_eq!(context.teardown().live_buffers, 0);
}
