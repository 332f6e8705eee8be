//! Index-mapped accumulate kernels.
//!
//! Work is split the way a GPU grid is: `n` work items are grouped into blocks of
//! [`LaunchConfig::threads_per_block`], and each work item handles one element
//! block of `block` scalars (the per-element shape `S1*S2*S3` of an array).
//!
//! Two accumulate directions exist and they are deliberately separate functions:
//!
//! - [`scatter_add`]: work item `i` adds source block `i` into destination block
//!   `indices[i]`. Many work items may hit the same destination, so every scalar
//!   update is atomic.
//! - [`gather_add_unique`]: work item `i` adds source block `indices[i]` into
//!   destination block `i`. Each destination block has exactly one writer, so the
//!   update is a plain read-modify-write.
//!
//! Index values are not checked against the destination (or source) extent.
//! Argument lengths are, and a mismatch is reported as a launch failure before
//! any work is issued. Every launch completes before the call returns.

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;

use gpuarr_dtype::ScalarDType;

use crate::allocator::RawBuffer;
use crate::buffer::Buffer;
use crate::element::Element;
use crate::error::{Error, Result};

/// Threads per block used unless configured otherwise.
pub const THREADS_PER_BLOCK: usize = 256;

/// Upper bound on blocks for grid-stride kernels (reductions).
pub const BLOCKS_PER_GRID: usize = 1024;

/// Block partitioning of a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub threads_per_block: usize,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self { threads_per_block: THREADS_PER_BLOCK }
    }
}

impl LaunchConfig {
    pub fn new(threads_per_block: usize) -> Self {
        Self { threads_per_block: threads_per_block.max(1) }
    }

    /// Blocks needed to cover `n` work items.
    pub fn blocks(&self, n: usize) -> usize {
        n.div_ceil(self.threads_per_block)
    }

    /// Threads launched per block for `n` work items.
    pub fn threads(&self, n: usize) -> usize {
        self.threads_per_block.min(n).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    ScatterAdd,
    GatherAdd,
    ReduceSum,
    ReduceMax,
}

impl KernelKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ScatterAdd => "scatter_add",
            Self::GatherAdd => "gather_add",
            Self::ReduceSum => "reduce_sum",
            Self::ReduceMax => "reduce_max",
        }
    }
}

fn launch_error(kind: KernelKind, reason: impl Into<String>) -> Error {
    Error::LaunchFailed { kernel: kind.name(), reason: reason.into() }
}

fn check_dtype(kind: KernelKind, role: &str, buffer: &Buffer, expected: ScalarDType) -> Result<()> {
    if buffer.dtype() != expected {
        return Err(launch_error(kind, format!("{role} is {}, expected {expected}", buffer.dtype())));
    }
    Ok(())
}

fn check_len(kind: KernelKind, role: &str, buffer: &Buffer, required: usize) -> Result<()> {
    if buffer.numel() < required {
        return Err(launch_error(kind, format!("{role} holds {} scalars, launch needs {required}", buffer.numel())));
    }
    Ok(())
}

/// Validated operands of one accumulate launch.
struct Operands {
    indices: Buffer,
    src: Buffer,
}

fn prepare<T: Element>(
    kind: KernelKind,
    dst: &Buffer,
    indices: &Buffer,
    src: &Buffer,
    n: usize,
    block: usize,
) -> Result<Operands> {
    if block == 0 {
        return Err(launch_error(kind, "element block must hold at least one scalar"));
    }
    check_dtype(kind, "destination", dst, T::DTYPE)?;
    check_dtype(kind, "source", src, T::DTYPE)?;
    check_dtype(kind, "indices", indices, ScalarDType::Int32)?;
    check_len(kind, "indices", indices, n)?;
    match kind {
        KernelKind::ScatterAdd => check_len(kind, "source", src, n * block)?,
        _ => check_len(kind, "destination", dst, n * block)?,
    }
    dst.ensure_allocated()?;
    src.ensure_allocated()?;
    indices.ensure_allocated()?;
    dst.ensure_same_device(src)?;
    dst.ensure_same_device(indices)?;

    // Operands aliasing the destination are read from a snapshot.
    let src = if src.shares_allocation(dst) { src.detached_copy()? } else { src.clone() };
    let indices = if indices.shares_allocation(dst) { indices.detached_copy()? } else { indices.clone() };
    Ok(Operands { indices, src })
}

/// Atomically add source block `i` into destination block `indices[i]` for `i < n`.
///
/// Colliding indices accumulate; no contribution is lost.
pub fn scatter_add<T: Element>(
    dst: &mut Buffer,
    indices: &Buffer,
    src: &Buffer,
    n: usize,
    block: usize,
    config: LaunchConfig,
) -> Result<()> {
    let kind = KernelKind::ScatterAdd;
    if n == 0 {
        return Ok(());
    }
    let ops = prepare::<T>(kind, dst, indices, src, n, block)?;
    tracing::debug!(kernel = kind.name(), n, block, blocks = config.blocks(n), device = %dst.device_name(), "launch");

    match dst.raw()? {
        RawBuffer::Cpu { .. } => cpu::scatter_add::<T>(&*dst, &ops.indices, &ops.src, n, block, config),
        #[cfg(feature = "cuda")]
        RawBuffer::Cuda { .. } => cuda::accumulate::<T>(kind, &*dst, &ops.indices, &ops.src, n, block, config),
    }
}

/// Add source block `indices[i]` into destination block `i` for `i < n`.
///
/// Not atomic. Each work item owns destination block `i`, so the launch is
/// race free as long as the destination view is not written by anything else
/// while it runs. `indices` only address the source and may repeat.
pub fn gather_add_unique<T: Element>(
    dst: &mut Buffer,
    indices: &Buffer,
    src: &Buffer,
    n: usize,
    block: usize,
    config: LaunchConfig,
) -> Result<()> {
    let kind = KernelKind::GatherAdd;
    if n == 0 {
        return Ok(());
    }
    let ops = prepare::<T>(kind, dst, indices, src, n, block)?;
    tracing::debug!(kernel = kind.name(), n, block, blocks = config.blocks(n), device = %dst.device_name(), "launch");

    match dst.raw()? {
        RawBuffer::Cpu { .. } => cpu::gather_add_unique::<T>(&*dst, &ops.indices, &ops.src, n, block, config),
        #[cfg(feature = "cuda")]
        RawBuffer::Cuda { .. } => cuda::accumulate::<T>(kind, &*dst, &ops.indices, &ops.src, n, block, config),
    }
}

/// Sum of every scalar in `src`. Zero for an empty buffer.
pub fn reduce_sum<T: Element>(src: &Buffer, config: LaunchConfig) -> Result<T> {
    reduce::<T>(KernelKind::ReduceSum, src, config)
}

/// Largest scalar in `src`. [`Element::LOWEST`] for an empty buffer.
pub fn reduce_max<T: Element>(src: &Buffer, config: LaunchConfig) -> Result<T> {
    reduce::<T>(KernelKind::ReduceMax, src, config)
}

fn reduce<T: Element>(kind: KernelKind, src: &Buffer, config: LaunchConfig) -> Result<T> {
    check_dtype(kind, "source", src, T::DTYPE)?;
    src.ensure_allocated()?;
    tracing::debug!(kernel = kind.name(), n = src.numel(), device = %src.device_name(), "launch");

    match src.raw()? {
        RawBuffer::Cpu { .. } => cpu::reduce::<T>(kind, src, config),
        #[cfg(feature = "cuda")]
        RawBuffer::Cuda { .. } => cuda::reduce::<T>(kind, src, config),
    }
}
