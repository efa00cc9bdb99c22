//! # tessel-kernels
//!
//! Kernel catalog and launch protocol for the tessel dispatch engine.
//!
//! Provides:
//! - `KernelConfig`: the configuration tuple identifying a kernel, and its
//!   name grammar
//! - `GemmKernel`: the uniform kernel call signature
//! - `TiledGemmKernel`: host-executed reference kernels honouring block,
//!   wave, scheduler, split-K and padding parameters
//! - `KernelCatalog`: immutable per-operator registries with built-in
//!   FP8-rowwise, BF16 and grouped manifests
//! - `KernelArgumentRecord` / `KernelArgBuffer`: per-group argument records
//! - Runtime SIMD detection for the tile microkernel

pub mod args;
pub mod catalog;
pub mod config;
pub mod error;
pub mod kernel;
pub mod microkernel;
pub mod operand;
pub mod simd;

pub use args::{arg_u32, KernelArgBuffer, KernelArgumentRecord, ZeroFill};
pub use catalog::{CatalogBuilder, KernelCatalog, GROUPED_MIN_TILE};
pub use config::{KernelConfig, PaddingMode, Scheduler};
pub use error::KernelError;
pub use kernel::{Epilogue, GemmKernel, TiledGemmKernel};
pub use operand::{GemmOperands, OperandView};
pub use simd::SimdCapability;
