//! CUDA execution of the accumulate kernels.
//!
//! Kernel source is rendered per (element type, block length) so the inner loop
//! bound is a compile-time constant, compiled with NVRTC, and cached per device.

use std::collections::HashMap;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaModule, LaunchConfig as CudaLaunchConfig, PushKernelArg};
use gpuarr_dtype::ScalarDType;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use snafu::ResultExt;

use crate::allocator::RawBuffer;
use crate::buffer::Buffer;
use crate::element::Element;
use crate::error::{CudaSnafu, Error, NvrtcSnafu, Result};

use super::{BLOCKS_PER_GRID, KernelKind, LaunchConfig};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModuleKey {
    ordinal: usize,
    dtype: ScalarDType,
    block: usize,
}

static MODULES: Lazy<Mutex<HashMap<ModuleKey, Arc<CudaModule>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Drop the modules compiled for device `ordinal`.
pub fn clear_device(ordinal: usize) {
    MODULES.lock().retain(|key, _| key.ordinal != ordinal);
}

const PRELUDE: &str = r#"
__device__ __forceinline__ void accumulate(float* address, float value) { atomicAdd(address, value); }
__device__ __forceinline__ void accumulate(int* address, int value) { atomicAdd(address, value); }
__device__ __forceinline__ void accumulate(long long* address, long long value) {
    atomicAdd((unsigned long long*) address, (unsigned long long) value);
}
__device__ __forceinline__ void accumulate(double* address, double value) {
#if __CUDA_ARCH__ >= 600
    atomicAdd(address, value);
#else
    unsigned long long* bits = (unsigned long long*) address;
    unsigned long long old = *bits, assumed;
    do {
        assumed = old;
        old = atomicCAS(bits, assumed, __double_as_longlong(value + __longlong_as_double(assumed)));
    } while (assumed != old);
#endif
}

__device__ __forceinline__ void fold_max(int* address, int value) { atomicMax(address, value); }
__device__ __forceinline__ void fold_max(long long* address, long long value) { atomicMax(address, value); }
__device__ __forceinline__ void fold_max(float* address, float value) {
    int* bits = (int*) address;
    int old = *bits, assumed;
    do {
        assumed = old;
        old = atomicCAS(bits, assumed, __float_as_int(fmaxf(value, __int_as_float(assumed))));
    } while (assumed != old);
}
__device__ __forceinline__ void fold_max(double* address, double value) {
    unsigned long long* bits = (unsigned long long*) address;
    unsigned long long old = *bits, assumed;
    do {
        assumed = old;
        old = atomicCAS(bits, assumed, __double_as_longlong(fmax(value, __longlong_as_double(assumed))));
    } while (assumed != old);
}
"#;

const KERNELS: &str = r#"
extern "C" __global__ void scatter_add(const int n, T* dst, const T* src, const int* indices) {
    int i = threadIdx.x + blockDim.x * blockIdx.x;
    if (i < n) {
        long long p = indices[i];
        for (int k = 0; k < BLOCK; k++) {
            accumulate(&dst[p * BLOCK + k], src[(long long) i * BLOCK + k]);
        }
    }
}

extern "C" __global__ void gather_add(const int n, T* dst, const T* src, const int* indices) {
    int i = threadIdx.x + blockDim.x * blockIdx.x;
    if (i < n) {
        long long p = indices[i];
        for (int k = 0; k < BLOCK; k++) {
            dst[(long long) i * BLOCK + k] += src[p * BLOCK + k];
        }
    }
}

extern "C" __global__ void reduce_sum(const long long n, const T* src, T* out) {
    T acc = 0;
    for (long long i = threadIdx.x + (long long) blockDim.x * blockIdx.x; i < n; i += (long long) blockDim.x * gridDim.x) {
        acc += src[i];
    }
    accumulate(out, acc);
}

extern "C" __global__ void reduce_max(const long long n, const T* src, T* out) {
    T acc = LOWEST;
    for (long long i = threadIdx.x + (long long) blockDim.x * blockIdx.x; i < n; i += (long long) blockDim.x * gridDim.x) {
        acc = src[i] > acc ? src[i] : acc;
    }
    fold_max(out, acc);
}
"#;

fn lowest_literal(dtype: ScalarDType) -> &'static str {
    match dtype {
        ScalarDType::Int32 => "(-2147483647 - 1)",
        ScalarDType::Int64 => "(-9223372036854775807LL - 1)",
        ScalarDType::Float32 => "__int_as_float(0xff800000)",
        ScalarDType::Float64 => "__longlong_as_double(0xfff0000000000000ULL)",
    }
}

fn render(dtype: ScalarDType, block: usize) -> String {
    format!(
        "#define T {}\n#define BLOCK {block}\n#define LOWEST {}\n{PRELUDE}{KERNELS}",
        dtype.c_style(),
        lowest_literal(dtype)
    )
}

fn module(device: &Arc<CudaContext>, dtype: ScalarDType, block: usize) -> Result<Arc<CudaModule>> {
    let key = ModuleKey { ordinal: device.ordinal(), dtype, block };
    if let Some(module) = MODULES.lock().get(&key) {
        return Ok(Arc::clone(module));
    }

    let name = format!("accumulate_{dtype}_{block}");
    let ptx = cudarc::nvrtc::compile_ptx(render(dtype, block)).context(NvrtcSnafu { kernel: name.clone() })?;
    let module = device.load_module(ptx).context(CudaSnafu)?;
    tracing::debug!(module = %name, ordinal = key.ordinal, "compiled CUDA module");

    Ok(Arc::clone(MODULES.lock().entry(key).or_insert(module)))
}

fn launch_failed(kind: KernelKind) -> impl Fn(cudarc::driver::DriverError) -> Error {
    move |e| Error::LaunchFailed { kernel: kind.name(), reason: e.to_string() }
}

fn grid(blocks: usize, threads: usize) -> CudaLaunchConfig {
    CudaLaunchConfig { grid_dim: (blocks as u32, 1, 1), block_dim: (threads as u32, 1, 1), shared_mem_bytes: 0 }
}

pub(crate) fn accumulate<T: Element>(
    kind: KernelKind,
    dst: &Buffer,
    indices: &Buffer,
    src: &Buffer,
    n: usize,
    block: usize,
    config: LaunchConfig,
) -> Result<()> {
    let (RawBuffer::Cuda { data: dst_data, device }, RawBuffer::Cuda { data: idx_data, .. }, RawBuffer::Cuda { data: src_data, .. }) =
        (dst.raw()?, indices.raw()?, src.raw()?)
    else {
        return Err(Error::LaunchFailed { kernel: kind.name(), reason: "operands are not CUDA buffers".to_string() });
    };
    let count = i32::try_from(n)
        .map_err(|_| Error::LaunchFailed { kernel: kind.name(), reason: format!("{n} work items exceed i32 range") })?;

    let function = module(device, T::DTYPE, block)?.load_function(kind.name()).context(CudaSnafu)?;
    let stream = device.default_stream();

    let mut dst_cuda = dst_data.borrow_mut();
    let idx_cuda = idx_data.borrow();
    let src_cuda = src_data.borrow();
    let mut dst_view = dst_cuda.slice_mut(dst.range());
    let idx_view = idx_cuda.slice(indices.range());
    let src_view = src_cuda.slice(src.range());

    let mut builder = stream.launch_builder(&function);
    builder.arg(&count);
    builder.arg(&mut dst_view);
    builder.arg(&src_view);
    builder.arg(&idx_view);
    unsafe { builder.launch(grid(config.blocks(n), config.threads(n))) }.map_err(launch_failed(kind))?;
    stream.synchronize().map_err(launch_failed(kind))
}

pub(crate) fn reduce<T: Element>(kind: KernelKind, src: &Buffer, config: LaunchConfig) -> Result<T> {
    let RawBuffer::Cuda { data, device } = src.raw()? else {
        return Err(Error::LaunchFailed { kernel: kind.name(), reason: "operand is not a CUDA buffer".to_string() });
    };
    let n = src.numel();
    let mut result = match kind {
        KernelKind::ReduceMax => T::LOWEST,
        _ => T::default(),
    };
    if n == 0 {
        return Ok(result);
    }

    let function = module(device, T::DTYPE, 1)?.load_function(kind.name()).context(CudaSnafu)?;
    let stream = device.default_stream();

    let mut out = stream.alloc_zeros::<u8>(size_of::<T>()).context(CudaSnafu)?;
    stream.memcpy_htod(bytemuck::bytes_of(&result), &mut out).map_err(launch_failed(kind))?;

    let count = n as i64;
    let cuda_data = data.borrow();
    let view = cuda_data.slice(src.range());
    let blocks = config.blocks(n).min(BLOCKS_PER_GRID);

    let mut builder = stream.launch_builder(&function);
    builder.arg(&count);
    builder.arg(&view);
    builder.arg(&mut out);
    unsafe { builder.launch(grid(blocks, config.threads(n))) }.map_err(launch_failed(kind))?;

    stream.memcpy_dtoh(&out, bytemuck::bytes_of_mut(&mut result)).map_err(launch_failed(kind))?;
    stream.synchronize().map_err(launch_failed(kind))?;
    Ok(result)
}
