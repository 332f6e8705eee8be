use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::{Arc, OnceLock};

use gpuarr_dtype::ScalarDType;
use smallvec::{SmallVec, smallvec};

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::error::{DeviceMismatchSnafu, Error, InvalidViewSnafu, NotAllocatedSnafu, Result, SizeMismatchSnafu};

/// Allocation state behind every view of one buffer.
#[derive(Debug)]
pub(crate) struct BufferData {
    /// Set on first use.
    raw: OnceLock<RawBuffer>,
    allocator: Arc<dyn Allocator>,
    total_size: usize,
    options: BufferOptions,
}

impl BufferData {
    fn new(allocator: Arc<dyn Allocator>, size: usize, options: BufferOptions) -> Self {
        Self { raw: OnceLock::new(), allocator, total_size: size, options }
    }

    /// Allocate on first call. A losing racer returns its memory to the allocator.
    fn ensure_allocated(&self) -> Result<()> {
        if self.raw.get().is_some() {
            return Ok(());
        }

        let raw = self.allocator.alloc(self.total_size, &self.options)?;
        tracing::debug!(allocator = self.allocator.name(), size = self.total_size, "buffer allocated");

        if let Err(raw) = self.raw.set(raw) {
            self.allocator.free(raw, &self.options);
        }

        Ok(())
    }

    fn is_allocated(&self) -> bool {
        self.raw.get().is_some()
    }

    fn raw(&self) -> Result<&RawBuffer> {
        self.raw.get().ok_or(Error::NotAllocated)
    }

    pub(crate) fn total_size(&self) -> usize {
        self.total_size
    }
}

impl Drop for BufferData {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            tracing::debug!(allocator = self.allocator.name(), size = self.total_size, "buffer released");
            self.allocator.free(raw, &self.options);
        }
    }
}

/// Handle to a byte range of a device allocation.
///
/// Clones and views share the allocation, which is freed with the last handle.
/// Handles stay on the thread that created them (`!Send + !Sync`); every
/// operation blocks until the device has finished it.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Rc<BufferData>,
    /// Byte offset and length inside `data`.
    offset: usize,
    size: usize,
    dtype: ScalarDType,
    shape: SmallVec<[usize; 4]>,
    _not_send_sync: PhantomData<Rc<()>>,
}

impl Buffer {
    /// Buffer of `shape` scalars, allocated on first use.
    pub fn new(allocator: Arc<dyn Allocator>, dtype: ScalarDType, shape: Vec<usize>, options: BufferOptions) -> Self {
        let size = dtype.bytes() * shape.iter().product::<usize>();
        Self {
            data: Rc::new(BufferData::new(allocator, size, options)),
            offset: 0,
            size,
            dtype,
            shape: SmallVec::from_vec(shape),
            _not_send_sync: PhantomData,
        }
    }

    /// Like [`Buffer::new`], but allocates now so failures surface here.
    pub fn allocate(
        allocator: Arc<dyn Allocator>,
        dtype: ScalarDType,
        shape: Vec<usize>,
        options: BufferOptions,
    ) -> Result<Self> {
        let buffer = Self::new(allocator, dtype, shape, options);
        buffer.ensure_allocated()?;
        Ok(buffer)
    }

    pub(crate) fn from_shared(data: Rc<BufferData>, dtype: ScalarDType, shape: Vec<usize>) -> Self {
        let size = data.total_size;
        Self { data, offset: 0, size, dtype, shape: SmallVec::from_vec(shape), _not_send_sync: PhantomData }
    }

    pub(crate) fn shared_data(&self) -> &Rc<BufferData> {
        &self.data
    }

    pub(crate) fn downgrade(&self) -> Weak<BufferData> {
        Rc::downgrade(&self.data)
    }

    /// `size` bytes starting `offset` bytes into this view.
    pub fn view(&self, offset: usize, size: usize) -> Result<Self> {
        if offset.checked_add(size).is_none_or(|end| end > self.size) {
            return InvalidViewSnafu { offset, size, buffer_size: self.size }.fail();
        }

        Ok(Self {
            data: Rc::clone(&self.data),
            offset: self.offset + offset,
            size,
            dtype: self.dtype,
            shape: smallvec![size / self.dtype.bytes()],
            _not_send_sync: PhantomData,
        })
    }

    pub fn ensure_allocated(&self) -> Result<()> {
        self.data.ensure_allocated()
    }

    pub fn is_allocated(&self) -> bool {
        self.data.is_allocated()
    }

    /// View length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte offset inside the allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn dtype(&self) -> ScalarDType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of scalars covered by this view.
    pub fn numel(&self) -> usize {
        self.size / self.dtype.bytes()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.data.allocator
    }

    /// Whether two buffers are views of the same allocation.
    pub fn shares_allocation(&self, other: &Buffer) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Number of live handles (views included) to the underlying allocation.
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.data)
    }

    pub(crate) fn raw(&self) -> Result<&RawBuffer> {
        self.data.raw()
    }

    /// Byte range of this view inside the base allocation.
    pub(crate) fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }

    /// Name of the device holding this buffer.
    pub fn device_name(&self) -> String {
        match self.data.raw() {
            Ok(raw) => raw.device_name(),
            Err(_) => self.data.allocator.name().to_string(),
        }
    }

    /// Set this view to binary zero on the device.
    pub fn zero(&self) -> Result<()> {
        self.ensure_allocated()?;

        let raw = self.data.raw()?;
        if self.offset == 0 && self.size == raw.size() {
            return raw.fill_zero();
        }

        match raw {
            RawBuffer::Cpu { data } => {
                data.borrow_mut().as_bytes_mut()[self.range()].fill(0);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                let stream = device.default_stream();
                let mut cuda_data = data.borrow_mut();
                let mut view = cuda_data.slice_mut(self.range());
                stream.memset_zeros(&mut view).map_err(transfer_error)?;
                stream.synchronize().map_err(transfer_error)
            }
        }
    }

    /// Upload `src`, which must be exactly as long as the view.
    pub fn copyin(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_allocated()?;

        let expected = self.size;
        let actual = src.len();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        let raw = self.data.raw()?;
        match raw {
            RawBuffer::Cpu { data } => {
                data.borrow_mut().as_bytes_mut()[self.range()].copy_from_slice(src);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                let stream = device.default_stream();
                let mut cuda_data = data.borrow_mut();
                let mut view = cuda_data.slice_mut(self.range());
                stream.memcpy_htod(src, &mut view).map_err(transfer_error)?;
                stream.synchronize().map_err(transfer_error)
            }
        }
    }

    /// Download the view into `dst`, which must be exactly as long as the view.
    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        self.ensure_allocated()?;

        let expected = self.size;
        let actual = dst.len();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        let raw = self.data.raw()?;
        match raw {
            RawBuffer::Cpu { data } => {
                dst.copy_from_slice(&data.borrow().as_bytes()[self.range()]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                let stream = device.default_stream();
                let cuda_data = data.borrow();
                let view = cuda_data.slice(self.range());
                stream.memcpy_dtoh(&view, dst).map_err(transfer_error)?;
                stream.synchronize().map_err(transfer_error)
            }
        }
    }

    /// Allocate a fresh buffer on the same allocator holding a copy of this view.
    pub fn detached_copy(&self) -> Result<Buffer> {
        let mut copy = Buffer::allocate(
            Arc::clone(&self.data.allocator),
            self.dtype,
            vec![self.numel()],
            BufferOptions::default(),
        )?;
        copy.copy_from(self)?;
        Ok(copy)
    }

    /// Device-side copy of an equally sized view, in any direction between CPU and CUDA.
    ///
    /// Two views of one allocation go through a temporary so overlap is safe.
    pub fn copy_from(&mut self, src: &Buffer) -> Result<()> {
        self.ensure_allocated()?;
        src.ensure_allocated()?;

        let expected = self.size;
        let actual = src.size;
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        if self.shares_allocation(src) {
            if self.offset == src.offset {
                return Ok(());
            }
            let staged = src.detached_copy()?;
            return self.copy_from(&staged);
        }

        let into = self.data.raw()?;
        let from = src.data.raw()?;

        match (into, from) {
            (RawBuffer::Cpu { data: dst_data }, RawBuffer::Cpu { data: src_data }) => {
                let source = src_data.borrow();
                dst_data.borrow_mut().as_bytes_mut()[self.range()].copy_from_slice(&source.as_bytes()[src.range()]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            (RawBuffer::Cuda { data: dst_data, device: dst_device }, RawBuffer::Cuda { data: src_data, device }) => {
                snafu::ensure!(
                    dst_device.ordinal() == device.ordinal(),
                    DeviceMismatchSnafu { lhs: self.device_name(), rhs: src.device_name() }
                );
                let stream = dst_device.default_stream();
                let mut dst_cuda = dst_data.borrow_mut();
                let src_cuda = src_data.borrow();
                let mut dst_view = dst_cuda.slice_mut(self.range());
                let src_view = src_cuda.slice(src.range());
                stream.memcpy_dtod(&src_view, &mut dst_view).map_err(transfer_error)?;
                stream.synchronize().map_err(transfer_error)
            }
            #[cfg(feature = "cuda")]
            (RawBuffer::Cuda { data: dst_data, device }, RawBuffer::Cpu { data: src_data }) => {
                let stream = device.default_stream();
                let mut dst_cuda = dst_data.borrow_mut();
                let src_ref = src_data.borrow();
                let mut dst_view = dst_cuda.slice_mut(self.range());
                stream.memcpy_htod(&src_ref.as_bytes()[src.range()], &mut dst_view).map_err(transfer_error)?;
                stream.synchronize().map_err(transfer_error)
            }
            #[cfg(feature = "cuda")]
            (RawBuffer::Cpu { data: dst_data }, RawBuffer::Cuda { data: src_data, device }) => {
                let stream = device.default_stream();
                let mut dst_mut = dst_data.borrow_mut();
                let src_cuda = src_data.borrow();
                let src_view = src_cuda.slice(src.range());
                stream.memcpy_dtoh(&src_view, &mut dst_mut.as_bytes_mut()[self.range()]).map_err(transfer_error)?;
                stream.synchronize().map_err(transfer_error)
            }
        }
    }

    /// Ensure two buffers can take part in one kernel launch.
    pub(crate) fn ensure_same_device(&self, other: &Buffer) -> Result<()> {
        let (lhs, rhs) = (self.device_name(), other.device_name());
        snafu::ensure!(lhs == rhs, DeviceMismatchSnafu { lhs, rhs });
        Ok(())
    }

    /// Wait for the device of this buffer to go idle.
    pub fn synchronize(&self) -> Result<()> {
        self.data.allocator.synchronize()
    }

    /// Address of the underlying allocation, for identity checks in tests.
    #[cfg(test)]
    pub(crate) fn raw_data_ptr(&self) -> usize {
        match self.data.raw().expect("buffer not allocated") {
            RawBuffer::Cpu { data } => data.borrow().as_bytes().as_ptr() as usize,
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, .. } => &*data.borrow() as *const _ as usize,
        }
    }
}

#[cfg(feature = "cuda")]
fn transfer_error(source: cudarc::driver::DriverError) -> Error {
    Error::TransferFailed { reason: source.to_string() }
}
