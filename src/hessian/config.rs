//! Numeric constants of the trace estimator

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default cap on estimator iterations per score
pub const HESSIAN_NUM_ITERATIONS: usize = 50;
/// Iterations that must pass before convergence is checked
pub const MIN_HESSIAN_ITER: usize = 10;
/// Relative change of the running mean below which the estimate has converged
pub const HESSIAN_COMP_TOLERANCE: f32 = 1e-3;
/// Guards the relative-change denominator
pub const HESSIAN_EPS: f32 = 1e-6;

fn default_num_iterations() -> usize {
    HESSIAN_NUM_ITERATIONS
}

fn default_min_iterations() -> usize {
    MIN_HESSIAN_ITER
}

fn default_tolerance() -> f32 {
    HESSIAN_COMP_TOLERANCE
}

fn default_epsilon() -> f32 {
    HESSIAN_EPS
}

/// Estimator configuration shared by every calculator of a service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HessianConfig {
    #[serde(default = "default_num_iterations")]
    pub num_iterations: usize,
    #[serde(default = "default_min_iterations")]
    pub min_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    /// Base seed for the random probe vectors; drawn from the OS when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for HessianConfig {
    fn default() -> Self {
        Self {
            num_iterations: HESSIAN_NUM_ITERATIONS,
            min_iterations: MIN_HESSIAN_ITER,
            tolerance: HESSIAN_COMP_TOLERANCE,
            epsilon: HESSIAN_EPS,
            seed: None,
        }
    }
}

impl HessianConfig {
    pub fn with_num_iterations(mut self, num_iterations: usize) -> Self {
        self.num_iterations = num_iterations;
        self
    }

    pub fn with_min_iterations(mut self, min_iterations: usize) -> Self {
        self.min_iterations = min_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_iterations == 0 {
            return Err(Error::ConfigError(
                "num_iterations must be at least 1".into(),
            ));
        }
        if self.min_iterations >= self.num_iterations {
            return Err(Error::ConfigError(format!(
                "min_iterations ({}) must be smaller than num_iterations ({})",
                self.min_iterations, self.num_iterations
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(Error::ConfigError(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(Error::ConfigError(format!(
                "epsilon must be positive and finite, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}
