use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};

use crate::float8::F8E4M3;

/// Element types understood by the dispatch engine.
///
/// GEMM operators consume BF16 or F8E4M3 operands with F32 scales and
/// produce BF16. Embedding operators read F32/F16/BF16 tables, or U8 row
/// buffers holding quantized rows, and take I32 or I64 indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 16-bit Brain Float (same exponent range as F32, reduced mantissa)
    BF16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 8-bit float, 4 exponent bits, 3 mantissa bits, finite-only (e4m3fn)
    F8E4M3,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// Raw byte, used for packed quantized rows
    U8,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F8E4M3 | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::F32 => write!(f, "f32"),
            DType::F8E4M3 => write!(f, "f8e4m3"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
            DType::U8 => write!(f, "u8"),
        }
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            "f32" => Ok(DType::F32),
            "f8e4m3" | "fp8" => Ok(DType::F8E4M3),
            "i32" => Ok(DType::I32),
            "i64" => Ok(DType::I64),
            "u8" => Ok(DType::U8),
            other => Err(format!("unknown dtype '{other}'")),
        }
    }
}

// =============================================================================
// Element mapping
// =============================================================================

/// A Rust scalar type that can live in tensor storage.
///
/// Every element converts to and from `f32`, which is the accumulation type
/// of the reference kernels.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f32(self) -> f32 {
        self
    }
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;

    fn to_f32(self) -> f32 {
        f32::from(self)
    }
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    fn to_f32(self) -> f32 {
        f32::from(self)
    }
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl Element for F8E4M3 {
    const DTYPE: DType = DType::F8E4M3;

    fn to_f32(self) -> f32 {
        F8E4M3::to_f32(self)
    }
    fn from_f32(v: f32) -> Self {
        F8E4M3::from_f32(v)
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;

    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v as i32
    }
}

impl Element for u8 {
    const DTYPE: DType = DType::U8;

    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v as u8
    }
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;

    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v as i64
    }
}
