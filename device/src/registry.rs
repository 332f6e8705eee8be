//! Per-device allocators, created on first use and shared process-wide.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};

pub use gpuarr_dtype::DeviceSpec;

use crate::allocator::{Allocator, CpuAllocator, LruAllocator, TrackingAllocator};
use crate::error::{InvalidDeviceSnafu, Result};

/// Parsing of device strings such as `"CPU"`, `"cuda"`, `"CUDA:1"` or `"gpu:2"`.
///
/// Case and surrounding whitespace are ignored; a bare CUDA/GPU name means ordinal 0.
pub trait DeviceSpecExt {
    fn parse(s: &str) -> Result<DeviceSpec>;
}

impl DeviceSpecExt for DeviceSpec {
    fn parse(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        let (kind, ordinal) = match normalized.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (normalized.as_str(), None),
        };

        match (kind, ordinal) {
            ("CPU", None) => Ok(DeviceSpec::Cpu),
            ("CUDA" | "GPU", None) => Ok(DeviceSpec::Cuda { device_id: 0 }),
            ("CUDA" | "GPU", Some(ordinal)) => match ordinal.parse() {
                Ok(device_id) => Ok(DeviceSpec::Cuda { device_id }),
                Err(_) => InvalidDeviceSnafu { device: s.trim() }.fail(),
            },
            _ => InvalidDeviceSnafu { device: s.trim() }.fail(),
        }
    }
}

/// Number of devices of the same kind as `spec` visible to this process.
pub fn device_count(spec: &DeviceSpec) -> Result<usize> {
    match spec {
        DeviceSpec::Cpu => Ok(1),
        #[cfg(feature = "cuda")]
        DeviceSpec::Cuda { .. } => crate::allocator::CudaAllocator::device_count(),
        #[cfg(not(feature = "cuda"))]
        DeviceSpec::Cuda { .. } => Ok(0),
    }
}

/// Map from device to its allocator stack (reuse cache over tracking over the base).
#[derive(Default)]
pub struct DeviceRegistry {
    allocators: RwLock<HashMap<DeviceSpec, Arc<dyn Allocator>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, spec: &DeviceSpec) -> Result<Arc<dyn Allocator>> {
        self.get_with_capacity(spec, LruAllocator::DEFAULT_CAPACITY)
    }

    /// Allocator for `spec`, created with room for `lru_capacity` cached buffers per
    /// size if this is the first request for the device. Later requests share it
    /// whatever capacity they ask for.
    pub fn get_with_capacity(&self, spec: &DeviceSpec, lru_capacity: usize) -> Result<Arc<dyn Allocator>> {
        let allocators = self.allocators.upgradable_read();
        if let Some(existing) = allocators.get(spec) {
            return Ok(Arc::clone(existing));
        }

        let allocator = build_stack(spec, lru_capacity)?;
        RwLockUpgradableReadGuard::upgrade(allocators).insert(spec.clone(), Arc::clone(&allocator));
        tracing::debug!(device = %spec, lru_capacity, "device allocator created");
        Ok(allocator)
    }

    pub fn get_device(&self, device: &str) -> Result<Arc<dyn Allocator>> {
        self.get(&<DeviceSpec as DeviceSpecExt>::parse(device)?)
    }
}

fn build_stack(spec: &DeviceSpec, lru_capacity: usize) -> Result<Arc<dyn Allocator>> {
    let base: Box<dyn Allocator> = match spec {
        DeviceSpec::Cpu => Box::new(CpuAllocator),
        #[cfg(feature = "cuda")]
        DeviceSpec::Cuda { device_id } => Box::new(crate::allocator::CudaAllocator::new(*device_id)?),
        #[cfg(not(feature = "cuda"))]
        DeviceSpec::Cuda { .. } => {
            return InvalidDeviceSnafu { device: format!("{spec} (built without the `cuda` feature)") }.fail();
        }
    };

    // Tracking sits below the cache so cached buffers still count as device memory.
    let tracked = TrackingAllocator::new(base);
    Ok(Arc::new(LruAllocator::with_capacity(Box::new(tracked), lru_capacity)))
}

static REGISTRY: Lazy<DeviceRegistry> = Lazy::new(DeviceRegistry::new);

/// The process-wide registry.
pub fn registry() -> &'static DeviceRegistry {
    &REGISTRY
}

/// Process-wide allocator for a device string.
pub fn get_device(device: &str) -> Result<Arc<dyn Allocator>> {
    registry().get_device(device)
}

/// Process-wide CPU allocator.
pub fn cpu() -> Result<Arc<dyn Allocator>> {
    registry().get(&DeviceSpec::Cpu)
}

/// Process-wide allocator of CUDA device `device_id`.
#[cfg(feature = "cuda")]
pub fn cuda(device_id: usize) -> Result<Arc<dyn Allocator>> {
    registry().get(&DeviceSpec::Cuda { device_id })
}
