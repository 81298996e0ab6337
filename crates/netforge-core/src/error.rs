use std::fmt;

use thiserror::Error;

/// Which part of two adjacent module descriptors disagreed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mismatch {
    Shape,
    BatchSize,
    ElementType,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mismatch::Shape => "shape",
            Mismatch::BatchSize => "batch size",
            Mismatch::ElementType => "element type",
        })
    }
}

/// A composition was rejected before any backend resource existed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompositionError {
    #[error("shape must have at least one dimension")]
    EmptyShape,

    #[error("sequential chain must contain at least one module")]
    EmptyChain,

    /// Member `index` does not accept what member `index - 1` produces.
    #[error("module {index} {field} mismatch: previous produces {produced}, module expects {expected}")]
    ChainMismatch {
        index: usize,
        field: Mismatch,
        produced: String,
        expected: String,
    },

    #[error("{buffer} buffer has {actual} values, expected {expected}")]
    ParameterLength {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid linear layer shapes: {reason}")]
    InvalidLinearShape { reason: String },

    #[error("softmax axis {axis} out of range for rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },

    #[error("invalid layer widths: {reason}")]
    InvalidWidths { reason: String },

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("expected parameters for {expected} linear layers, got {actual}")]
    ParameterCount { expected: usize, actual: usize },

    #[error("network batch size {requested} does not match module batch size {module}")]
    BatchSizeMismatch { module: usize, requested: usize },
}
