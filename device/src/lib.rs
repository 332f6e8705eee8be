//! Device memory and index-mapped accumulate kernels.
//!
//! Memory is obtained from an [`Allocator`] (usually the per-device allocator held
//! by the [`registry`]), wrapped in reference-counted [`Buffer`] handles, and
//! shared between handles through a [`SharedPool`]. The [`kernel`] module runs the
//! scatter-add and gather-add kernels on either backend.
//!
//! The CPU backend is always available and executes kernels with rayon. The CUDA
//! backend is enabled with the `cuda` feature.

pub mod allocator;
pub mod buffer;
pub mod context;
pub mod element;
pub mod error;
pub mod kernel;
pub mod pool;
pub mod registry;


#[cfg(feature = "cuda")]
pub use allocator::CudaAllocator;
pub use allocator::{
    Allocator, AllocatorStats, BufferOptions, CpuAllocator, HostMemory, LruAllocator, RawBuffer, TrackingAllocator,
};
pub use buffer::Buffer;
pub use context::{ContextConfig, DeviceContext};
pub use element::Element;
pub use error::{Error, OrAbort, Result};
pub use kernel::{LaunchConfig, THREADS_PER_BLOCK};
pub use pool::{Acquisition, PoolKey, SharedPool};
pub use registry::{DeviceRegistry, DeviceSpec, DeviceSpecExt, device_count, get_device};
