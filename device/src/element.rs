//! Scalar element trait used by device kernels.
//!
//! Every element type knows how to be added atomically in place, which is what the
//! scatter-add kernel needs when several work items target the same destination.
//! Floating point types have no native atomic add, so they go through a
//! compare-and-swap loop on the bit pattern. Comparing bits rather than values keeps
//! the loop from spinning forever on NaN.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use bytemuck::Pod;
use gpuarr_dtype::ext::HasDType;

pub trait Element:
    HasDType + Pod + Default + PartialOrd + Add<Output = Self> + AddAssign + Send + Sync + fmt::Debug + fmt::Display
{
    /// Atomic cell with the same size and alignment as `Self`.
    type Atomic: Send + Sync;

    /// Identity of `maximum`.
    const LOWEST: Self;

    /// Reinterpret an exclusively borrowed slice as atomic cells.
    ///
    /// # Panics
    ///
    /// Panics if the slice is not aligned for `Self::Atomic`.
    fn as_atomic(slice: &mut [Self]) -> &[Self::Atomic];

    fn atomic_add(cell: &Self::Atomic, value: Self);

    /// Plain addition with the same overflow behavior as `atomic_add`: integers wrap.
    fn accumulate(self, other: Self) -> Self;

    fn maximum(self, other: Self) -> Self;

    fn to_f64(self) -> f64;
}

macro_rules! atomic_view {
    ($ty:ty, $atomic:ty) => {
        fn as_atomic(slice: &mut [$ty]) -> &[$atomic] {
            const { assert!(size_of::<$ty>() == size_of::<$atomic>()) };
            assert!(slice.as_ptr().cast::<$atomic>().is_aligned(), "unaligned atomic view");
            // SAFETY: same size, alignment checked above, and the exclusive borrow
            // guarantees no non-atomic access for the lifetime of the returned slice.
            unsafe { &*(slice as *mut [$ty] as *const [$atomic]) }
        }
    };
}

macro_rules! impl_float_element {
    ($($ty:ty => $atomic:ty),* $(,)?) => {$(
        impl Element for $ty {
            type Atomic = $atomic;
            const LOWEST: Self = <$ty>::NEG_INFINITY;

            atomic_view!($ty, $atomic);

            fn atomic_add(cell: &$atomic, value: $ty) {
                let mut current = cell.load(Ordering::Relaxed);
                loop {
                    let next = (<$ty>::from_bits(current) + value).to_bits();
                    match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                        Ok(_) => break,
                        Err(actual) => current = actual,
                    }
                }
            }

            fn accumulate(self, other: $ty) -> $ty {
                self + other
            }

            fn maximum(self, other: $ty) -> $ty {
                self.max(other)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    )*};
}

macro_rules! impl_int_element {
    ($($ty:ty => $atomic:ty),* $(,)?) => {$(
        impl Element for $ty {
            type Atomic = $atomic;
            const LOWEST: Self = <$ty>::MIN;

            atomic_view!($ty, $atomic);

            fn atomic_add(cell: &$atomic, value: $ty) {
                cell.fetch_add(value, Ordering::AcqRel);
            }

            fn accumulate(self, other: $ty) -> $ty {
                self.wrapping_add(other)
            }

            fn maximum(self, other: $ty) -> $ty {
                Ord::max(self, other)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    )*};
}

impl_float_element! { f32 => AtomicU32, f64 => AtomicU64 }
impl_int_element! { i32 => AtomicI32, i64 => AtomicI64 }
