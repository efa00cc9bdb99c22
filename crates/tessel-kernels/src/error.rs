/// Errors raised while validating or launching a kernel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("invalid kernel name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid kernel configuration '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("duplicate kernel '{0}' in catalog")]
    DuplicateKernel(String),

    #[error("kernel '{kernel}' cannot serve group {group} with shape {m}x{n}x{k}")]
    UnsupportedShape {
        kernel: String,
        group: u32,
        m: u32,
        n: u32,
        k: u32,
    },

    #[error("kernel '{kernel}' requires operand '{operand}'")]
    MissingOperand { kernel: String, operand: &'static str },

    #[error("group {group}: {operand} access out of bounds (needs {needed} elements, has {len})")]
    OutOfBounds {
        group: u32,
        operand: &'static str,
        needed: usize,
        len: usize,
    },

    #[error("dimension {0} does not fit a 32-bit argument field")]
    DimensionOverflow(usize),
}

pub type Result<T> = std::result::Result<T, KernelError>;
