use crate::dtype::DType;

/// Errors raised by the tensor substrate and the pipeline core.
///
/// Every variant is a configuration or protocol violation detected eagerly;
/// there are no transient/retryable failures in this domain.
#[derive(Debug, thiserror::Error)]
pub enum LaminaError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("unsupported dtype {0} for this operation")]
    UnsupportedDType(DType),

    #[error("invalid reshape of {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("infeasible partition: {0}")]
    InfeasiblePartition(String),

    #[error("shared weight group '{group}': {msg}")]
    SharedWeightMismatch { group: String, msg: String },

    #[error("unsupported pooling method '{0}'")]
    UnsupportedPooling(String),

    #[error("unsupported padding side '{0}'")]
    UnsupportedPaddingSide(String),

    #[error("{0}")]
    Config(String),
}
