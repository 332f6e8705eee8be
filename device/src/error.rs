use std::panic::Location;

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The allocator could not satisfy a request.
    #[snafu(display("failed to allocate {size} bytes on {device}: {reason}"))]
    AllocationFailed { device: String, size: usize, reason: String },

    /// A host/device or device/device copy failed.
    #[snafu(display("transfer failed: {reason}"))]
    TransferFailed { reason: String },

    /// A kernel launch was rejected or reported a fault.
    #[snafu(display("kernel '{kernel}' failed to launch: {reason}"))]
    LaunchFailed { kernel: &'static str, reason: String },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Device string or ordinal that names no usable device.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    /// Buffers taking part in one operation live on different devices.
    #[snafu(display("buffers live on different devices: {lhs} and {rhs}"))]
    DeviceMismatch { lhs: String, rhs: String },

    /// Buffer is not allocated.
    #[snafu(display("buffer not allocated"))]
    NotAllocated,

    /// Invalid buffer view parameters.
    #[snafu(display("invalid view: offset {offset} + size {size} exceeds buffer size {buffer_size}"))]
    InvalidView { offset: usize, size: usize, buffer_size: usize },

    /// A typed view of raw memory is misaligned or not a whole number of elements.
    #[snafu(display("cannot view {size} bytes at offset {offset} as {dtype}"))]
    Layout { dtype: String, offset: usize, size: usize },

    /// A shared pool slot was reacquired with a different size.
    #[snafu(display("pool slot {key} holds {expected} bytes, requested {actual}"))]
    PoolSlotMismatch { key: u64, expected: usize, actual: usize },

    #[cfg(feature = "cuda")]
    /// CUDA-specific errors.
    #[snafu(display("CUDA error: {source}"))]
    Cuda { source: cudarc::driver::DriverError },

    #[cfg(feature = "cuda")]
    /// Runtime kernel compilation failed.
    #[snafu(display("NVRTC compilation of '{kernel}' failed: {source}"))]
    Nvrtc { kernel: String, source: cudarc::nvrtc::CompileError },
}

/// Terminate-on-error policy for device results.
///
/// Numeric kernels must not continue after a device fault, so the top level of a
/// driver calls `.or_abort()` instead of propagating. The error and the caller's
/// file and line are logged before the process exits.
pub trait OrAbort<T> {
    #[track_caller]
    fn or_abort(self) -> T;
}

impl<T, E: std::fmt::Display> OrAbort<T> for std::result::Result<T, E> {
    #[track_caller]
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(error) => {
                let caller = Location::caller();
                tracing::error!(file = caller.file(), line = caller.line(), %error, "device operation failed");
                eprintln!("device error: {error} at {}:{}", caller.file(), caller.line());
                std::process::exit(1)
            }
        }
    }
}
