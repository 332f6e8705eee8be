//! Element type and device descriptors shared by the gpuarr crates.

pub mod ext;


/// Scalar element types that can live in a device array.
///
/// `Int32` doubles as the index type of scatter/gather kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::FromRepr)]
#[repr(u8)]
pub enum ScalarDType {
    Int32 = 0,
    Int64 = 1,
    Float32 = 2,
    Float64 = 3,
}

impl ScalarDType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Int32 => 4,
            Self::Int64 => 8,
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    /// Type name used when rendering device kernel source.
    pub const fn c_style(&self) -> &'static str {
        match self {
            Self::Int32 => "int",
            Self::Int64 => "long long",
            Self::Float32 => "float",
            Self::Float64 => "double",
        }
    }
}

/// Device an array's memory lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSpec {
    /// Host-emulated device memory; kernels run on the CPU thread pool.
    Cpu,
    /// CUDA device selected by ordinal.
    Cuda { device_id: usize },
}

impl DeviceSpec {
    /// Canonical string form, inverse of parsing (`"CPU"`, `"CUDA:1"`).
    pub fn canonicalize(&self) -> String {
        match self {
            Self::Cpu => "CPU".to_string(),
            Self::Cuda { device_id } => format!("CUDA:{device_id}"),
        }
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonicalize())
    }
}
