//! CPU execution of the accumulate kernels.
//!
//! A launch block maps to one rayon task; work items inside a block run in order.

use std::cell::RefCell;

use rayon::prelude::*;

use crate::allocator::{HostMemory, RawBuffer};
use crate::buffer::Buffer;
use crate::element::Element;
use crate::error::{Error, LayoutSnafu, Result};

use super::{KernelKind, LaunchConfig};

fn host_memory(buffer: &Buffer) -> Result<&RefCell<HostMemory>> {
    match buffer.raw()? {
        RawBuffer::Cpu { data } => Ok(data),
        #[cfg(feature = "cuda")]
        raw => Err(Error::DeviceMismatch { lhs: "CPU".to_string(), rhs: raw.device_name() }),
    }
}

fn typed<'a, T: Element>(bytes: &'a [u8], buffer: &Buffer) -> Result<&'a [T]> {
    bytemuck::try_cast_slice(bytes).map_err(|_| layout_error::<T>(buffer))
}

fn typed_mut<'a, T: Element>(bytes: &'a mut [u8], buffer: &Buffer) -> Result<&'a mut [T]> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|_| layout_error::<T>(buffer))
}

fn layout_error<T: Element>(buffer: &Buffer) -> Error {
    LayoutSnafu { dtype: T::DTYPE.to_string(), offset: buffer.offset(), size: buffer.size() }.build()
}

pub(crate) fn scatter_add<T: Element>(
    dst: &Buffer,
    indices: &Buffer,
    src: &Buffer,
    n: usize,
    block: usize,
    config: LaunchConfig,
) -> Result<()> {
    let mut dst_mem = host_memory(dst)?.borrow_mut();
    let idx_mem = host_memory(indices)?.borrow();
    let src_mem = host_memory(src)?.borrow();

    let dst_slice = typed_mut::<T>(&mut dst_mem.as_bytes_mut()[dst.range()], dst)?;
    let idx_slice = typed::<i32>(&idx_mem.as_bytes()[indices.range()], indices)?;
    let src_slice = typed::<T>(&src_mem.as_bytes()[src.range()], src)?;

    scatter_add_slices(dst_slice, &idx_slice[..n], &src_slice[..n * block], block, config);
    Ok(())
}

pub(crate) fn gather_add_unique<T: Element>(
    dst: &Buffer,
    indices: &Buffer,
    src: &Buffer,
    n: usize,
    block: usize,
    config: LaunchConfig,
) -> Result<()> {
    let mut dst_mem = host_memory(dst)?.borrow_mut();
    let idx_mem = host_memory(indices)?.borrow();
    let src_mem = host_memory(src)?.borrow();

    let dst_slice = typed_mut::<T>(&mut dst_mem.as_bytes_mut()[dst.range()], dst)?;
    let idx_slice = typed::<i32>(&idx_mem.as_bytes()[indices.range()], indices)?;
    let src_slice = typed::<T>(&src_mem.as_bytes()[src.range()], src)?;

    gather_add_slices(&mut dst_slice[..n * block], &idx_slice[..n], src_slice, block, config);
    Ok(())
}

pub(crate) fn reduce<T: Element>(kind: KernelKind, src: &Buffer, config: LaunchConfig) -> Result<T> {
    let src_mem = host_memory(src)?.borrow();
    let values = typed::<T>(&src_mem.as_bytes()[src.range()], src)?;

    Ok(match kind {
        KernelKind::ReduceMax => reduce_max_slice(values, config),
        _ => reduce_sum_slice(values, config),
    })
}

/// Scatter-add over host slices. `src` holds `indices.len()` blocks.
pub fn scatter_add_slices<T: Element>(
    dst: &mut [T],
    indices: &[i32],
    src: &[T],
    block: usize,
    config: LaunchConfig,
) {
    let cells = T::as_atomic(dst);
    let threads = config.threads_per_block;

    indices.par_chunks(threads).zip(src.par_chunks(threads * block)).for_each(|(lane_indices, lane_src)| {
        for (&p, contribution) in lane_indices.iter().zip(lane_src.chunks_exact(block)) {
            let base = p as usize * block;
            for (cell, &value) in cells[base..base + block].iter().zip(contribution) {
                T::atomic_add(cell, value);
            }
        }
    });
}

/// Gather-add over host slices. `dst` holds exactly `indices.len()` blocks.
pub fn gather_add_slices<T: Element>(
    dst: &mut [T],
    indices: &[i32],
    src: &[T],
    block: usize,
    config: LaunchConfig,
) {
    let threads = config.threads_per_block;

    dst.par_chunks_mut(threads * block).zip(indices.par_chunks(threads)).for_each(|(lane_dst, lane_indices)| {
        for (slot, &p) in lane_dst.chunks_exact_mut(block).zip(lane_indices) {
            let base = p as usize * block;
            for (out, &value) in slot.iter_mut().zip(&src[base..base + block]) {
                *out = out.accumulate(value);
            }
        }
    });
}

pub fn reduce_sum_slice<T: Element>(values: &[T], config: LaunchConfig) -> T {
    values
        .par_chunks(config.threads_per_block)
        .map(|chunk| chunk.iter().fold(T::default(), |acc, &v| acc.accumulate(v)))
        .reduce(T::default, T::accumulate)
}

pub fn reduce_max_slice<T: Element>(values: &[T], config: LaunchConfig) -> T {
    values
        .par_chunks(config.threads_per_block)
        .map(|chunk| chunk.iter().fold(T::LOWEST, |acc, &v| acc.maximum(v)))
        .reduce(|| T::LOWEST, T::maximum)
}
