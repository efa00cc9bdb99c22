use crate::DType;

/// Errors raised by the tensor layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TesselError {
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(DType),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("invalid axis {axis} for tensor of rank {ndim}")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("tensor is not contiguous")]
    NonContiguous,

    #[error("storage error: {0}")]
    StorageError(String),
}
