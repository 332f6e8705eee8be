//! Process-wide device setup and teardown.
//!
//! A driver creates one [`DeviceContext`] per process (per rank when running
//! several processes on a multi-device host). It selects the device, owns the
//! shared pool used by pooled arrays, and on teardown returns cached memory to
//! the device and reports anything still outstanding.

use std::cell::Cell;
use std::sync::Arc;

use bon::bon;

use crate::allocator::{Allocator, AllocatorStats, LruAllocator};
use crate::error::{InvalidDeviceSnafu, Result};
use crate::kernel::{LaunchConfig, THREADS_PER_BLOCK};
use crate::pool::SharedPool;
use crate::registry::{self, DeviceRegistry, DeviceSpec, DeviceSpecExt};

/// Configuration of a [`DeviceContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Requested device. For CUDA the rank offsets the device id.
    pub device: DeviceSpec,
    /// Index of this process among those sharing the host.
    pub rank: usize,
    pub threads_per_block: usize,
    /// Keep pooled buffers alive between array handles.
    pub retain_shared: bool,
    /// Freed buffers cached per size by the allocator.
    pub lru_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            device: DeviceSpec::Cpu,
            rank: 0,
            threads_per_block: THREADS_PER_BLOCK,
            retain_shared: false,
            lru_capacity: LruAllocator::DEFAULT_CAPACITY,
        }
    }
}

#[bon]
impl ContextConfig {
    /// Create a context configuration with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = DeviceSpec::Cpu)] device: DeviceSpec,
        #[builder(default = 0)] rank: usize,
        #[builder(default = THREADS_PER_BLOCK)] threads_per_block: usize,
        #[builder(default = false)] retain_shared: bool,
        #[builder(default = LruAllocator::DEFAULT_CAPACITY)] lru_capacity: usize,
    ) -> Self {
        Self { device, rank, threads_per_block, retain_shared, lru_capacity }
    }
}

impl ContextConfig {
    /// Read configuration from environment variables, falling back to defaults.
    ///
    /// # Environment Variables
    ///
    /// * `GPUARR_DEVICE` - Device string (`CPU`, `CUDA`, `CUDA:1`)
    /// * `GPUARR_RANK` - Process rank
    /// * `GPUARR_THREADS_PER_BLOCK` - Kernel block size
    /// * `GPUARR_POOL_RETAIN=1` - Retain pooled buffers between handles
    /// * `GPUARR_LRU_CAPACITY` - Cached buffers per size
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ContextConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let parse_usize = |key: &str, default: usize| lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default);

        let device = match lookup("GPUARR_DEVICE") {
            Some(device) => <DeviceSpec as DeviceSpecExt>::parse(&device)?,
            None => defaults.device,
        };

        Ok(Self {
            device,
            rank: parse_usize("GPUARR_RANK", defaults.rank),
            threads_per_block: parse_usize("GPUARR_THREADS_PER_BLOCK", defaults.threads_per_block).max(1),
            retain_shared: lookup("GPUARR_POOL_RETAIN").is_some_and(|v| matches!(v.trim(), "1" | "true" | "TRUE")),
            lru_capacity: parse_usize("GPUARR_LRU_CAPACITY", defaults.lru_capacity),
        })
    }
}

/// An initialized device: allocator, shared pool and launch settings.
#[derive(Debug)]
pub struct DeviceContext {
    spec: DeviceSpec,
    rank: usize,
    device_count: usize,
    allocator: Arc<dyn Allocator>,
    pool: SharedPool,
    launch: LaunchConfig,
    torn_down: Cell<bool>,
}

impl DeviceContext {
    /// Initialize against the global registry.
    pub fn init(config: &ContextConfig) -> Result<Self> {
        Self::init_with(registry::registry(), config)
    }

    pub fn init_with(registry: &DeviceRegistry, config: &ContextConfig) -> Result<Self> {
        let device_count = registry::device_count(&config.device)?;
        let spec = match &config.device {
            DeviceSpec::Cpu => DeviceSpec::Cpu,
            DeviceSpec::Cuda { device_id } => {
                if device_count == 0 {
                    return InvalidDeviceSnafu { device: format!("{} (no devices visible)", config.device) }.fail();
                }
                DeviceSpec::Cuda { device_id: (device_id + config.rank) % device_count }
            }
        };

        let allocator = registry.get_with_capacity(&spec, config.lru_capacity)?;
        let pool = SharedPool::with_retention(Arc::clone(&allocator), config.retain_shared);
        tracing::info!(devices = device_count, rank = config.rank, device = %spec, "device context initialized");

        Ok(Self {
            spec,
            rank: config.rank,
            device_count,
            allocator,
            pool,
            launch: LaunchConfig::new(config.threads_per_block),
            torn_down: Cell::new(false),
        })
    }

    /// The device actually selected.
    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    pub fn launch_config(&self) -> LaunchConfig {
        self.launch
    }

    /// Release pooled and cached memory and report what is still outstanding.
    ///
    /// Idempotent; also runs on drop. The returned statistics cover every user
    /// of this device's allocator, not only arrays created through this context.
    pub fn teardown(&self) -> AllocatorStats {
        if !self.torn_down.replace(true) {
            self.pool.clear();
            self.allocator.trim();
            match &self.spec {
                #[cfg(feature = "cuda")]
                DeviceSpec::Cuda { device_id } => crate::kernel::cuda::clear_device(*device_id),
                _ => {}
            }
            if let Err(error) = self.allocator.synchronize() {
                tracing::warn!(%error, device = %self.spec, "synchronize failed during teardown");
            }
        }

        let stats = self.allocator.stats();
        if stats.outstanding_buffers() > 0 {
            tracing::warn!(
                device = %self.spec,
                buffers = stats.outstanding_buffers(),
                bytes = stats.outstanding_bytes(),
                "device memory still outstanding at teardown"
            );
        } else {
            tracing::debug!(device = %self.spec, peak_bytes = stats.peak_bytes, "device context torn down");
        }
        stats
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if !self.torn_down.get() {
            self.teardown();
        }
    }
}
