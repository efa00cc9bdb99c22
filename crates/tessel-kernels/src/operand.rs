//! Borrowed, typed views of kernel operands.

use half::bf16;
use tessel_core::{DType, Tensor, TesselError, F8E4M3};

/// Element storage of a GEMM input operand.
#[derive(Debug, Clone, Copy)]
pub enum OperandView<'a> {
    Bf16(&'a [bf16]),
    F8E4M3(&'a [F8E4M3]),
    F32(&'a [f32]),
}

impl<'a> OperandView<'a> {
    /// Borrow a contiguous tensor as an operand.
    pub fn from_tensor(t: &'a Tensor) -> Result<Self, TesselError> {
        match t.dtype() {
            DType::BF16 => Ok(OperandView::Bf16(t.as_slice()?)),
            DType::F8E4M3 => Ok(OperandView::F8E4M3(t.as_slice()?)),
            DType::F32 => Ok(OperandView::F32(t.as_slice()?)),
            other => Err(TesselError::UnsupportedDType(other)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OperandView::Bf16(s) => s.len(),
            OperandView::F8E4M3(s) => s.len(),
            OperandView::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode `dst.len()` consecutive elements starting at `start`.
    #[inline]
    pub fn decode_into(&self, start: usize, dst: &mut [f32]) {
        let end = start + dst.len();
        match self {
            OperandView::Bf16(s) => {
                for (d, v) in dst.iter_mut().zip(&s[start..end]) {
                    *d = v.to_f32();
                }
            }
            OperandView::F8E4M3(s) => {
                for (d, v) in dst.iter_mut().zip(&s[start..end]) {
                    *d = v.to_f32();
                }
            }
            OperandView::F32(s) => dst.copy_from_slice(&s[start..end]),
        }
    }
}

/// Everything a kernel reads besides its argument buffer.
#[derive(Debug, Clone, Copy)]
pub struct GemmOperands<'a> {
    pub a: OperandView<'a>,
    pub b: OperandView<'a>,
    /// Per-row scales of A (rowwise-quantized kernels only).
    pub a_scale: Option<&'a [f32]>,
    /// Per-column scales of the output, i.e. per-row scales of B.
    pub b_scale: Option<&'a [f32]>,
}

impl<'a> GemmOperands<'a> {
    pub fn new(a: OperandView<'a>, b: OperandView<'a>) -> Self {
        Self {
            a,
            b,
            a_scale: None,
            b_scale: None,
        }
    }

    pub fn with_scales(mut self, a_scale: &'a [f32], b_scale: &'a [f32]) -> Self {
        self.a_scale = Some(a_scale);
        self.b_scale = Some(b_scale);
        self
    }
}
