pub mod body;
pub mod coefficients;
pub mod cpu_ref;
pub mod error;
pub mod gpu;
pub mod physics;
pub mod shaders;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{Result, SimError};
