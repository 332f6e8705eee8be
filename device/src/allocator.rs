use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaContext, CudaSlice};
use parking_lot::Mutex;
#[cfg(feature = "cuda")]
use snafu::ResultExt;

#[cfg(feature = "cuda")]
use crate::error::CudaSnafu;
use crate::error::{AllocationFailedSnafu, Result};

/// Host allocation standing in for device memory on the CPU backend.
///
/// Backed by `u64` words so every typed view the kernels take (up to 8-byte
/// scalars and their atomic counterparts) is aligned.
#[derive(Debug)]
pub struct HostMemory {
    words: Box<[u64]>,
    len: usize,
}

impl HostMemory {
    /// Allocate `len` zeroed bytes, reporting exhaustion instead of aborting.
    pub fn zeroed(len: usize) -> Result<Self> {
        let count = len.div_ceil(size_of::<u64>());
        let mut words = Vec::new();
        if let Err(e) = words.try_reserve_exact(count) {
            return AllocationFailedSnafu { device: "CPU", size: len, reason: e.to_string() }.fail();
        }
        words.resize(count, 0);
        Ok(Self { words: words.into_boxed_slice(), len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    pub fn fill_zero(&mut self) {
        self.words.fill(0);
    }
}

/// One allocation as handed out by an [`Allocator`].
///
/// Contents sit behind a `RefCell`; the owning [`Buffer`](crate::Buffer) never leaves its thread.
#[derive(Debug)]
pub enum RawBuffer {
    Cpu {
        data: RefCell<HostMemory>,
    },
    #[cfg(feature = "cuda")]
    Cuda {
        data: RefCell<CudaSlice<u8>>,
        device: Arc<CudaContext>,
    },
}

impl RawBuffer {
    pub fn size(&self) -> usize {
        match self {
            RawBuffer::Cpu { data } => data.borrow().len(),
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, .. } => data.borrow().len(),
        }
    }

    /// Name of the device this memory lives on.
    pub fn device_name(&self) -> String {
        match self {
            RawBuffer::Cpu { .. } => "CPU".to_string(),
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { device, .. } => format!("CUDA:{}", device.ordinal()),
        }
    }

    /// Set every byte of the allocation to zero.
    pub fn fill_zero(&self) -> Result<()> {
        match self {
            RawBuffer::Cpu { data } => {
                data.borrow_mut().fill_zero();
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                let stream = device.default_stream();
                stream.memset_zeros(&mut *data.borrow_mut()).context(CudaSnafu)?;
                stream.synchronize().context(CudaSnafu)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Hand out memory cleared to zero.
    pub zero_init: bool,
}

/// Snapshot of an allocator's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Device allocations not yet returned to the device.
    pub live_buffers: usize,
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    pub total_allocations: usize,
    /// Allocations parked in a reuse cache (counted in `live_*`).
    pub cached_buffers: usize,
    pub cached_bytes: usize,
}

impl AllocatorStats {
    /// Allocations currently held by buffers rather than by a cache.
    pub fn outstanding_buffers(&self) -> usize {
        self.live_buffers.saturating_sub(self.cached_buffers)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.live_bytes.saturating_sub(self.cached_bytes)
    }
}

pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;
    fn free(&self, _buffer: RawBuffer, _options: &BufferOptions) {}
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
    /// Return any cached allocations to the device.
    fn trim(&self) {}
    fn stats(&self) -> AllocatorStats {
        AllocatorStats::default()
    }
    fn name(&self) -> &str;
}

/// CPU allocator using system memory.
#[derive(Debug, Clone)]
pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> Result<RawBuffer> {
        let data = HostMemory::zeroed(size)?;
        Ok(RawBuffer::Cpu { data: RefCell::new(data) })
    }

    fn name(&self) -> &str {
        "CPU"
    }
}

/// CUDA allocator using GPU memory.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone)]
pub struct CudaAllocator {
    device: Arc<CudaContext>,
    device_id: usize,
}

#[cfg(feature = "cuda")]
impl CudaAllocator {
    pub fn new(device_id: usize) -> Result<Self> {
        let device = CudaContext::new(device_id).context(CudaSnafu)?;
        Ok(Self { device, device_id })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Number of CUDA devices visible to this process.
    pub fn device_count() -> Result<usize> {
        let count = CudaContext::device_count().context(CudaSnafu)?;
        Ok(count as usize)
    }
}

#[cfg(feature = "cuda")]
impl Allocator for CudaAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        let stream = self.device.default_stream();
        let data = if options.zero_init { stream.alloc_zeros::<u8>(size) } else { unsafe { stream.alloc::<u8>(size) } }
            .map_err(|e| crate::Error::AllocationFailed {
                device: format!("CUDA:{}", self.device_id),
                size,
                reason: e.to_string(),
            })?;

        Ok(RawBuffer::Cuda { data: RefCell::new(data), device: Arc::clone(&self.device) })
    }

    fn synchronize(&self) -> Result<()> {
        self.device.default_stream().synchronize().context(CudaSnafu)
    }

    fn name(&self) -> &str {
        "CUDA"
    }
}

/// Allocator wrapper that counts what is outstanding on the device.
#[derive(Debug)]
pub struct TrackingAllocator {
    inner: Box<dyn Allocator>,
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    total_allocations: AtomicUsize,
}

impl TrackingAllocator {
    pub fn new(inner: Box<dyn Allocator>) -> Self {
        Self {
            inner,
            live_buffers: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
        }
    }
}

impl Allocator for TrackingAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        let buffer = self.inner.alloc(size, options)?;

        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
        tracing::trace!(allocator = self.inner.name(), size, live_bytes = live, "device alloc");

        Ok(buffer)
    }

    fn free(&self, buffer: RawBuffer, options: &BufferOptions) {
        let size = buffer.size();
        self.inner.free(buffer, options);

        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
        tracing::trace!(allocator = self.inner.name(), size, "device free");
    }

    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }

    fn trim(&self) {
        self.inner.trim()
    }

    fn stats(&self) -> AllocatorStats {
        let inner = self.inner.stats();
        AllocatorStats {
            live_buffers: self.live_buffers.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            ..inner
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Keeps freed allocations, bucketed by exact byte size, and hands them out again.
///
/// At most `max_buffers_per_size` are parked per size; the rest go straight back to
/// the inner allocator. When the inner allocator runs dry, the cache is released
/// and the request retried once.
#[derive(Debug)]
pub struct LruAllocator {
    inner: Box<dyn Allocator>,
    cache: Mutex<HashMap<usize, Vec<RawBuffer>>>,
    max_buffers_per_size: usize,
    name: String,
}

impl LruAllocator {
    pub const DEFAULT_CAPACITY: usize = 32;

    pub fn new(inner: Box<dyn Allocator>) -> Self {
        Self::with_capacity(inner, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: Box<dyn Allocator>, max_buffers_per_size: usize) -> Self {
        let name = inner.name().to_string();
        Self { inner, cache: Mutex::new(HashMap::new()), max_buffers_per_size, name }
    }

    fn take_cached(&self, size: usize) -> Option<RawBuffer> {
        let mut cache = self.cache.lock();
        let buffers = cache.get_mut(&size)?;
        let buffer = buffers.pop();
        if buffers.is_empty() {
            cache.remove(&size);
        }
        buffer
    }
}

impl Allocator for LruAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        let Some(buffer) = self.take_cached(size) else {
            return self.inner.alloc(size, options).or_else(|first| {
                tracing::debug!(allocator = %self.name, size, "allocation failed, releasing cache");
                self.trim();
                self.inner.alloc(size, options).map_err(|_| first)
            });
        };

        if options.zero_init {
            buffer.fill_zero()?;
        }
        tracing::trace!(allocator = %self.name, size, "reused cached buffer");
        Ok(buffer)
    }

    fn free(&self, buffer: RawBuffer, options: &BufferOptions) {
        let overflow = {
            let mut cache = self.cache.lock();
            let bucket = cache.entry(buffer.size()).or_default();
            if bucket.len() < self.max_buffers_per_size {
                bucket.push(buffer);
                None
            } else {
                Some(buffer)
            }
        };

        if let Some(buffer) = overflow {
            self.inner.free(buffer, options);
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }

    fn trim(&self) {
        let drained: Vec<RawBuffer> = self.cache.lock().drain().flat_map(|(_, buffers)| buffers).collect();
        let options = BufferOptions::default();
        for buffer in drained {
            self.inner.free(buffer, &options);
        }
        self.inner.trim();
    }

    fn stats(&self) -> AllocatorStats {
        let (cached_buffers, cached_bytes) = {
            let cache = self.cache.lock();
            cache.iter().fold((0, 0), |(count, bytes), (size, buffers)| {
                (count + buffers.len(), bytes + size * buffers.len())
            })
        };
        AllocatorStats { cached_buffers, cached_bytes, ..self.inner.stats() }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
