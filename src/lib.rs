//! # Cuantizar: Hessian-trace sensitivity for post-training quantization
//!
//! Cuantizar scores how sensitive a float model's output is to perturbations
//! of each layer's weights or activations, using a Hutchinson estimate of the
//! Hessian trace. Mixed-precision search and other quantization passes use the
//! scores to decide where bits matter.
//!
//! ## Architecture
//!
//! - **autograd**: Tape-based automatic differentiation with NHWC layer kernels
//! - **graph**: Validated DAG of layers, with shape inference and shared weights
//! - **framework**: Operator tables (kernel / activation / no-quantization)
//! - **backend**: Builds differentiable forward passes from a graph
//! - **hessian**: Trace calculator and the caching sensitivity service
//! - **analyzer**: Statistics-collector assignment and collection
//! - **config**: Declarative YAML run configuration and CLI arguments
//! - **report**: Text / JSON sensitivity reports

pub mod analyzer;
pub mod autograd;
pub mod backend;
pub mod config;
pub mod framework;
pub mod graph;
pub mod hessian;
pub mod report;

pub mod error;

// Re-export commonly used types
pub use autograd::{backward, Tensor};
pub use backend::{Backend, TapeBackend};
pub use error::{Error, Result};
pub use framework::FrameworkInfo;
pub use graph::{Graph, GraphBuilder, NodeId, Op, OpType};
pub use hessian::{
    HessianConfig, HessianInfoGranularity, HessianInfoService, HessianMode, TraceHessianCalculator,
    TraceHessianRequest,
};
