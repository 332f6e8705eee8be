//! Diagnostic summary of an array's contents.

use std::fmt;

use gpuarr_device::Element;
use gpuarr_dtype::ScalarDType;

use crate::array::Ownership;

/// Shape, placement and value statistics of a [`DeviceArray`](crate::DeviceArray).
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayInfo {
    pub dtype: ScalarDType,
    /// `[n, S1, S2, S3]`.
    pub shape: [usize; 4],
    pub buf_size: usize,
    pub device: String,
    pub ownership: Ownership,
    pub stats: Option<ValueStats>,
}

/// Statistics over every scalar. Absent for empty arrays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
}

impl ValueStats {
    pub fn of<T: Element>(values: &[T]) -> Option<Self> {
        let (first, rest) = values.split_first()?;
        let first = first.to_f64();
        let (min, max, sum) = rest.iter().fold((first, first, first), |(min, max, sum), v| {
            let v = v.to_f64();
            (min.min(v), max.max(v), sum + v)
        });
        Some(Self { min, max, sum, mean: sum / values.len() as f64 })
    }
}

impl ArrayInfo {
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ArrayInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [n, s1, s2, s3] = self.shape;
        write!(f, "{}[{n}; {s1}x{s2}x{s3}] {} bytes on {} ({})", self.dtype, self.buf_size, self.device, self.ownership)?;
        match &self.stats {
            Some(s) => write!(f, " min={} max={} sum={} mean={}", s.min, s.max, s.sum, s.mean),
            None => write!(f, " empty"),
        }
    }
}
