use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Shape error: {0}")]
    ShapeError(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Incompatible shapes for operation {op}: {shape_a:?} and {shape_b:?}")]
    IncompatibleShapes {
        op: String,
        shape_a: Vec<usize>,
        shape_b: Vec<usize>,
    },

    #[error("Slice range {start}..{end} is invalid for axis {axis} of size {size}")]
    SliceOutOfRange {
        axis: usize,
        start: isize,
        end: isize,
        size: usize,
    },

    #[error("Invalid axis {0}")]
    InvalidAxis(isize),

    #[error("Index out of bounds: index {index}, size {size}")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("Tensor is uninitialized")]
    Uninitialized,

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Unknown initialization scheme: {0}")]
    UnknownInitScheme(String),

    #[error("Error during tensor initialization")]
    InitializationError,

    #[error("Graph misuse on node '{node}': {reason}")]
    GraphMisuse { node: String, reason: String },

    #[error("Unknown node id {0}")]
    UnknownNode(usize),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Jacobian check error: analytical={analytical}, numerical={numerical}, abs_error={abs_error}, at_index={at_index}")]
    JacobianCheckError {
        analytical: f64,
        numerical: f64,
        abs_error: f64,
        at_index: usize,
    },
}

/// Specifies the reduction to apply to the output of a loss function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    /// No reduction applied (one loss value per sample).
    None,
    /// The output is summed over all samples.
    Sum,
    /// The output is averaged over all samples.
    #[default]
    Mean,
}
