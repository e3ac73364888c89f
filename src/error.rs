//! Error types for Cuantizar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{op} node '{node}' is not supported for Hessian info w.r.t {mode}")]
    UnsupportedOperator {
        node: String,
        op: String,
        mode: String,
    },

    #[error(
        "Hessian scores w.r.t weights are supported, for now, for a single-weight node; \
         node '{node}' has {found}"
    )]
    UnsupportedTopology { node: String, found: String },

    #[error(
        "Can't concat model's outputs for gradients calculation since the shape of the \
         first axis is not equal in all outputs: {sizes:?}"
    )]
    OutputBatchMismatch { sizes: Vec<usize> },

    #[error(
        "Representative dataset exhausted: {requested} batches required but only {produced} available"
    )]
    DataExhausted { requested: usize, produced: usize },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node '{node}' has no weight attribute '{attribute}'")]
    MissingWeight { node: String, attribute: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Computation cancelled")]
    Cancelled,

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;
