use tessel_core::TesselError;
use tessel_kernels::KernelError;

/// Errors surfaced by dispatch entry points.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Caller-supplied tensors or descriptors are malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The shape is valid but no catalog can serve it.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// A kernel launch failed; never retried.
    #[error("device fault: {0}")]
    DeviceFault(#[from] KernelError),

    #[error("table error: {0}")]
    Table(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] TesselError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Shorthand for `Err(DispatchError::InvalidArgument(..))`.
macro_rules! invalid {
    ($($arg:tt)*) => {
        Err($crate::error::DispatchError::InvalidArgument(format!($($arg)*)))
    };
}

pub(crate) use invalid;
