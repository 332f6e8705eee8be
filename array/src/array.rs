use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use gpuarr_device::kernel::{self, LaunchConfig};
use gpuarr_device::{Allocator, Buffer, BufferOptions, DeviceContext, Element, PoolKey, SharedPool};
use snafu::{OptionExt, ResultExt, ensure};

use crate::error::{DeviceSnafu, NotAcquiredSnafu, OutOfRangeSnafu, PartialElementSnafu, Result, SizeMismatchSnafu};
use crate::info::{ArrayInfo, ValueStats};

/// How an array holds its device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Memory belongs to this array alone and is acquired at construction.
    Owned,
    /// Memory is a shared pool slot, acquired by [`DeviceArray::to_device_memory`].
    Shared { key: PoolKey },
}

impl Ownership {
    /// Numeric identifier: zero for owned arrays, the pool key otherwise.
    pub fn id(&self) -> u64 {
        match self {
            Self::Owned => 0,
            Self::Shared { key } => key.get(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared { .. })
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned => f.write_str("owned"),
            Self::Shared { key } => write!(f, "shared {key}"),
        }
    }
}

/// `n` elements of `S1 x S2 x S3` scalars of `T`, resident in device memory.
///
/// Element `i` occupies scalars `i * S1*S2*S3 .. (i + 1) * S1*S2*S3` of the
/// buffer. Every operation blocks until the device has finished with it.
///
/// Arrays are `!Send + !Sync`, like the [`Buffer`] they wrap.
#[derive(Debug)]
pub struct DeviceArray<T: Element, const S1: usize = 1, const S2: usize = 1, const S3: usize = 1> {
    n: usize,
    data: Option<Buffer>,
    ownership: Ownership,
    pool: Option<SharedPool>,
    launch: LaunchConfig,
    _element: PhantomData<T>,
}

impl<T: Element, const S1: usize, const S2: usize, const S3: usize> DeviceArray<T, S1, S2, S3> {
    /// Scalars per element.
    pub const BLOCK: usize = {
        assert!(S1 * S2 * S3 > 0, "element shape must not be empty");
        S1 * S2 * S3
    };

    /// Owned array of `n` elements, allocated immediately. Contents are unspecified.
    pub fn new(allocator: Arc<dyn Allocator>, n: usize) -> Result<Self> {
        let buffer =
            Buffer::allocate(allocator, T::DTYPE, Self::buffer_shape(n), BufferOptions::default()).context(DeviceSnafu)?;
        tracing::debug!(dtype = %T::DTYPE, n, block = Self::BLOCK, "owned array created");
        Ok(Self::from_parts(n, Some(buffer), Ownership::Owned, None))
    }

    /// Owned array holding a copy of `values`, which must be whole elements.
    pub fn from_host(allocator: Arc<dyn Allocator>, values: &[T]) -> Result<Self> {
        ensure!(values.len() % Self::BLOCK == 0, PartialElementSnafu { len: values.len(), block: Self::BLOCK });
        let mut array = Self::new(allocator, values.len() / Self::BLOCK)?;
        array.to_device(values)?;
        Ok(array)
    }

    /// Shared array of `n` elements in slot `key` of `pool`.
    ///
    /// No memory is touched until [`to_device_memory`](Self::to_device_memory).
    pub fn shared(pool: &SharedPool, key: PoolKey, n: usize) -> Self {
        Self::from_parts(n, None, Ownership::Shared { key }, Some(pool.clone()))
    }

    /// Owned array for `id == 0`, shared array in slot `id` otherwise.
    pub fn with_id(pool: &SharedPool, id: u64, n: usize) -> Result<Self> {
        match PoolKey::new(id) {
            Some(key) => Ok(Self::shared(pool, key, n)),
            None => Self::new(Arc::clone(pool.allocator()), n),
        }
    }

    /// Owned array on the context's device, using its launch configuration.
    pub fn in_context(context: &DeviceContext, n: usize) -> Result<Self> {
        Ok(Self::new(Arc::clone(context.allocator()), n)?.with_launch_config(context.launch_config()))
    }

    /// Shared array in the context's pool, using its launch configuration.
    pub fn shared_in(context: &DeviceContext, key: PoolKey, n: usize) -> Self {
        Self::shared(context.pool(), key, n).with_launch_config(context.launch_config())
    }

    fn from_parts(n: usize, data: Option<Buffer>, ownership: Ownership, pool: Option<SharedPool>) -> Self {
        Self { n, data, ownership, pool, launch: LaunchConfig::default(), _element: PhantomData }
    }

    fn buffer_shape(n: usize) -> Vec<usize> {
        vec![n, S1, S2, S3]
    }

    pub fn with_launch_config(mut self, launch: LaunchConfig) -> Self {
        self.launch = launch;
        self
    }

    pub fn launch_config(&self) -> LaunchConfig {
        self.launch
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// `[n, S1, S2, S3]`.
    pub fn shape(&self) -> [usize; 4] {
        [self.n, S1, S2, S3]
    }

    /// Number of scalars.
    pub fn numel(&self) -> usize {
        self.n * Self::BLOCK
    }

    /// Size of the device buffer in bytes.
    pub fn buf_size(&self) -> usize {
        self.numel() * size_of::<T>()
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Whether device memory is held.
    pub fn is_acquired(&self) -> bool {
        self.data.is_some()
    }

    /// The device buffer, if acquired.
    pub fn buffer(&self) -> Option<&Buffer> {
        self.data.as_ref()
    }

    fn buffer_ref(&self) -> Result<&Buffer> {
        self.data.as_ref().context(NotAcquiredSnafu { ownership: self.ownership })
    }

    fn buffer_mut(&mut self) -> Result<&mut Buffer> {
        let ownership = self.ownership;
        self.data.as_mut().context(NotAcquiredSnafu { ownership })
    }

    /// Make sure device memory is held.
    ///
    /// Returns `true` when memory was newly acquired (the caller must upload its
    /// data) and `false` when an existing shared buffer was reused and its
    /// contents are already resident. Owned arrays always report `true`.
    pub fn to_device_memory(&mut self) -> Result<bool> {
        if let Some(buffer) = &self.data {
            if self.ownership.is_shared() {
                return Ok(false);
            }
            buffer.ensure_allocated().context(DeviceSnafu)?;
            return Ok(true);
        }

        let (Ownership::Shared { key }, Some(pool)) = (self.ownership, &self.pool) else {
            return NotAcquiredSnafu { ownership: self.ownership }.fail();
        };
        let (buffer, acquisition) = pool.acquire(key, T::DTYPE, Self::buffer_shape(self.n)).context(DeviceSnafu)?;
        tracing::debug!(%key, n = self.n, fresh = acquisition.is_fresh(), "shared array acquired");
        self.data = Some(buffer);
        Ok(acquisition.is_fresh())
    }

    /// Set every scalar to binary zero.
    pub fn zero(&mut self) -> Result<()> {
        self.buffer_ref()?.zero().context(DeviceSnafu)
    }

    /// Copy the whole array to a new host vector.
    pub fn to_host(&self) -> Result<Vec<T>> {
        let buffer = self.buffer_ref()?;
        let mut values = vec![T::default(); self.numel()];
        buffer.copyout(bytemuck::cast_slice_mut(&mut values)).context(DeviceSnafu)?;
        Ok(values)
    }

    /// Overwrite the whole array with `values`.
    pub fn to_device(&mut self, values: &[T]) -> Result<()> {
        let expected = self.numel();
        ensure!(values.len() == expected, SizeMismatchSnafu { expected, actual: values.len() });
        self.buffer_mut()?.copyin(bytemuck::cast_slice(values)).context(DeviceSnafu)
    }

    /// Copy the first `count` scalars of `source` into this array, starting at
    /// element `index`.
    pub fn copy_from<const R1: usize, const R2: usize, const R3: usize>(
        &mut self,
        index: usize,
        source: &DeviceArray<T, R1, R2, R3>,
        count: usize,
    ) -> Result<()> {
        let start = index.saturating_mul(Self::BLOCK);
        let end = index.checked_mul(Self::BLOCK).and_then(|start| start.checked_add(count));
        ensure!(
            end.is_some_and(|end| end <= self.numel()),
            OutOfRangeSnafu { operation: "copy destination", start, count, len: self.numel() }
        );
        ensure!(
            count <= source.numel(),
            OutOfRangeSnafu { operation: "copy source", start: 0usize, count, len: source.numel() }
        );
        if count == 0 {
            return Ok(());
        }

        let bytes = count * size_of::<T>();
        let src = source.buffer_ref()?.view(0, bytes).context(DeviceSnafu)?;
        let mut dst = self.buffer_ref()?.view(start * size_of::<T>(), bytes).context(DeviceSnafu)?;
        dst.copy_from(&src).context(DeviceSnafu)
    }

    /// For every `i < n`, atomically add element `i` of `source` into element
    /// `indices[i]` of this array. Repeated indices accumulate.
    ///
    /// Index values must lie in `0..self.len()`; they are not checked.
    pub fn scatter_add(&mut self, indices: &DeviceArray<i32>, source: &Self, n: usize) -> Result<()> {
        let launch = self.launch;
        let idx = indices.buffer_ref()?;
        let src = source.buffer_ref()?;
        let dst = self.buffer_mut()?;
        kernel::scatter_add::<T>(dst, idx, src, n, Self::BLOCK, launch).context(DeviceSnafu)
    }

    /// For every `i < n`, add element `indices[i]` of `source` into element
    /// `index + i` of this array.
    ///
    /// Not atomic: each destination element has a single writer. Index values
    /// must lie in `0..source.len()`; they are not checked and may repeat.
    pub fn gather_add_unique(&mut self, index: usize, indices: &DeviceArray<i32>, source: &Self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let launch = self.launch;
        let idx = indices.buffer_ref()?;
        let src = source.buffer_ref()?;
        let buffer = self.buffer_ref()?;

        let Some(offset) = index.checked_mul(Self::BLOCK * size_of::<T>()) else {
            return OutOfRangeSnafu { operation: "gather destination", start: index, count: n, len: self.len() }.fail();
        };
        let mut dst = buffer.view(offset, buffer.size().saturating_sub(offset)).context(DeviceSnafu)?;
        kernel::gather_add_unique::<T>(&mut dst, idx, src, n, Self::BLOCK, launch).context(DeviceSnafu)
    }

    /// Sum of every scalar.
    pub fn reduce_sum(&self) -> Result<T> {
        kernel::reduce_sum::<T>(self.buffer_ref()?, self.launch).context(DeviceSnafu)
    }

    /// Largest scalar, or [`Element::LOWEST`] for an empty array.
    pub fn reduce_max(&self) -> Result<T> {
        kernel::reduce_max::<T>(self.buffer_ref()?, self.launch).context(DeviceSnafu)
    }

    /// Download the array and summarize it. The summary is also logged.
    pub fn info(&self) -> Result<ArrayInfo> {
        let values = self.to_host()?;
        let info = ArrayInfo {
            dtype: T::DTYPE,
            shape: self.shape(),
            buf_size: self.buf_size(),
            device: self.buffer_ref()?.device_name(),
            ownership: self.ownership,
            stats: ValueStats::of(&values),
        };
        tracing::info!(%info, "array info");
        Ok(info)
    }
}
