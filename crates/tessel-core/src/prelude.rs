//! Convenience re-exports for common tessel-core types.
//!
//! ```rust
//! use tessel_core::prelude::*;
//! ```

pub use crate::DType;
pub use crate::Device;
pub use crate::Element;
pub use crate::Result;
pub use crate::Shape;
pub use crate::Tensor;
pub use crate::TesselError;
pub use crate::F8E4M3;
pub use half::{bf16, f16};
