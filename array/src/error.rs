use snafu::Snafu;

use crate::array::Ownership;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("device operation failed: {source}"))]
    Device { source: gpuarr_device::Error },

    /// A shared array was used before `to_device_memory` acquired its slot.
    #[snafu(display("{ownership} array has no device memory yet"))]
    NotAcquired { ownership: Ownership },

    /// A host slice does not cover the array exactly.
    #[snafu(display("host data holds {actual} scalars, array holds {expected}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Host data is not a whole number of element blocks.
    #[snafu(display("{len} scalars do not form whole elements of {block} scalars"))]
    PartialElement { len: usize, block: usize },

    /// A scalar range does not fit inside an array.
    #[snafu(display("{operation}: scalars {start}..{} exceed array of {len} scalars", start + count))]
    OutOfRange { operation: &'static str, start: usize, count: usize, len: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
