//! Shape-parameterized arrays in device memory.
//!
//! A [`DeviceArray<T, S1, S2, S3>`](DeviceArray) holds `n` elements, each a block of
//! `S1 * S2 * S3` scalars. Arrays move data between host and device explicitly and
//! accumulate between arrays through index maps:
//!
//! ```
//! # use gpuarr_array::DeviceArray;
//! # fn main() -> gpuarr_array::Result<()> {
//! let cpu = gpuarr_device::registry::cpu().expect("CPU is always available");
//!
//! let mut cells = DeviceArray::<f64>::from_host(cpu.clone(), &[0.0; 3])?;
//! let faces = DeviceArray::<f64>::from_host(cpu.clone(), &[1.0, 2.0, 3.0, 4.0])?;
//! let owner = DeviceArray::<i32>::from_host(cpu, &[0, 2, 0, 0])?;
//!
//! cells.scatter_add(&owner, &faces, 4)?;
//! assert_eq!(cells.to_host()?, vec![8.0, 0.0, 2.0]);
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod error;
pub mod info;


pub use array::{DeviceArray, Ownership};
pub use error::{Error, Result};
pub use info::{ArrayInfo, ValueStats};

pub use gpuarr_device::{ContextConfig, DeviceContext, Element, LaunchConfig, OrAbort, PoolKey, SharedPool};
