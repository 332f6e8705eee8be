use super::*;

/// Maps a Rust scalar type to its [`ScalarDType`].
pub trait HasDType {
    const DTYPE: ScalarDType;
}

macro_rules! impl_dtype_ext {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl HasDType for $ty { const DTYPE: ScalarDType = $dtype; })*
    };
}

impl_dtype_ext! {
    i32 => ScalarDType::Int32, i64 => ScalarDType::Int64,
    f32 => ScalarDType::Float32, f64 => ScalarDType::Float64,
}
