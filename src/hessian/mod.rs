//! Hessian-trace sensitivity scores
//!
//! - [`TraceHessianCalculator`]: one Hutchinson estimate for one batch
//! - [`HessianInfoService`]: cached, dataset-driven scores per request
//! - [`RepresentativeDataset`]: where the batches come from

mod calculator;
mod cancel;
mod config;
mod dataset;
mod request;
mod service;


pub use calculator::{concat_outputs, reduce_to_granularity, TraceHessianCalculator};
pub use cancel::CancellationToken;
pub use config::{
    HessianConfig, HESSIAN_COMP_TOLERANCE, HESSIAN_EPS, HESSIAN_NUM_ITERATIONS, MIN_HESSIAN_ITER,
};
pub use dataset::{Batch, FiniteDataset, GeneratorDataset, RandomNormalDataset, RepresentativeDataset};
pub use request::{HessianInfoGranularity, HessianMode, TraceHessianRequest};
pub use service::HessianInfoService;
