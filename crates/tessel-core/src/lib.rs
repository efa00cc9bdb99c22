//! # tessel-core
//!
//! Tensor layer for the tessel kernel-dispatch engine.
//!
//! Provides the `Tensor` type the dispatch facade validates and feeds to
//! kernels:
//! - Element types used by GEMM and embedding operators (BF16, F16, F32,
//!   F8E4M3, I32, I64)
//! - Device residency tags (`cpu`, `cuda:N`)
//! - Strided views (reshape, transpose) over shared byte storage
//! - A float8 E4M3 codec for quantized operands

pub mod device;
pub mod dtype;
pub mod error;
pub mod float8;
pub mod prelude;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use device::Device;
pub use dtype::{DType, Element};
pub use error::TesselError;
pub use float8::F8E4M3;
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, TesselError>;
