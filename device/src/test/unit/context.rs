use std::collections::HashMap;

use gpuarr_dtype::ScalarDType;

use crate::allocator::Allocator;
use crate::registry::DeviceRegistry;
use crate::{Acquisition, ContextConfig, DeviceContext, DeviceSpec, Error, LaunchConfig, PoolKey};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_builder_defaults_match_default() {
    assert_eq!(ContextConfig::builder().build(), ContextConfig::default());
}

#[test]
fn test_builder_overrides() {
    let config = ContextConfig::builder().rank(3).threads_per_block(64).retain_shared(true).build();
    assert_eq!(config.rank, 3);
    assert_eq!(config.threads_per_block, 64);
    assert!(config.retain_shared);
    assert_eq!(config.device, DeviceSpec::Cpu);
}

#[test]
fn test_from_lookup_reads_every_variable() {
    let config = ContextConfig::from_lookup(lookup(&[
        ("GPUARR_DEVICE", "cuda:1"),
        ("GPUARR_RANK", "2"),
        ("GPUARR_THREADS_PER_BLOCK", "128"),
        ("GPUARR_POOL_RETAIN", "1"),
        ("GPUARR_LRU_CAPACITY", "4"),
    ]))
    .unwrap();

    assert_eq!(config.device, DeviceSpec::Cuda { device_id: 1 });
    assert_eq!(config.rank, 2);
    assert_eq!(config.threads_per_block, 128);
    assert!(config.retain_shared);
    assert_eq!(config.lru_capacity, 4);
}

#[test]
fn test_from_lookup_falls_back_on_garbage() {
    let config = ContextConfig::from_lookup(lookup(&[("GPUARR_RANK", "two"), ("GPUARR_THREADS_PER_BLOCK", "0")])).unwrap();
    assert_eq!(config.rank, 0);
    assert_eq!(config.threads_per_block, 1);
}

#[test]
fn test_from_lookup_rejects_bad_device() {
    let result = ContextConfig::from_lookup(lookup(&[("GPUARR_DEVICE", "quantum")]));
    assert!(matches!(result, Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_init_cpu_context() {
    let registry = DeviceRegistry::new();
    let config = ContextConfig::builder().rank(5).threads_per_block(32).build();
    let context = DeviceContext::init_with(&registry, &config).unwrap();

    assert_eq!(context.spec(), &DeviceSpec::Cpu);
    assert_eq!(context.rank(), 5);
    assert_eq!(context.device_count(), 1);
    assert_eq!(context.launch_config(), LaunchConfig::new(32));
    assert_eq!(context.allocator().name(), "CPU");
}

#[test]
fn test_teardown_releases_pool_and_cache() {
    let registry = DeviceRegistry::new();
    let config = ContextConfig::builder().retain_shared(true).build();
    let context = DeviceContext::init_with(&registry, &config).unwrap();

    let key = PoolKey::new(1).unwrap();
    let (_, acquisition) = context.pool().acquire(key, ScalarDType::Float32, vec![64]).unwrap();
    assert_eq!(acquisition, Acquisition::Fresh);
    assert_eq!(context.allocator().stats().outstanding_buffers(), 1);

    let stats = context.teardown();
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.peak_bytes, 256);
    assert!(context.pool().is_empty());

    // Idempotent.
    assert_eq!(context.teardown(), stats);
}

#[test]
fn test_teardown_reports_outstanding_buffers() {
    let registry = DeviceRegistry::new();
    let context = DeviceContext::init_with(&registry, &ContextConfig::default()).unwrap();

    let (buffer, _) = context.pool().acquire(PoolKey::new(2).unwrap(), ScalarDType::Int32, vec![4]).unwrap();
    let stats = context.teardown();
    assert_eq!(stats.outstanding_buffers(), 1);

    drop(buffer);
    assert_eq!(context.allocator().stats().outstanding_buffers(), 0);
}

#[cfg(not(feature = "cuda"))]
#[test]
fn test_init_cuda_without_devices_fails() {
    let registry = DeviceRegistry::new();
    let config = ContextConfig::builder().device(DeviceSpec::Cuda { device_id: 0 }).build();
    assert!(matches!(DeviceContext::init_with(&registry, &config), Err(Error::InvalidDevice { .. })));
}
