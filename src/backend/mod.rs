//! Float model builder
//!
//! A [`Backend`] turns a [`Graph`] plus one input batch into a [`ForwardPass`]:
//! a differentiable instance of the float model whose tape is retained until
//! the pass is dropped.

mod forward;
mod tape;


pub use forward::ForwardPass;
pub use tape::TapeBackend;

use crate::error::Result;
use crate::graph::Graph;
use ndarray::ArrayD;

/// Which leaves of the forward pass record gradients
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GradTracking {
    /// Plain inference
    #[default]
    Disabled,
    /// Learnable weights only
    Weights,
    /// Learnable weights and model inputs, so every intermediate tensor gets a gradient
    WeightsAndInputs,
}

impl GradTracking {
    pub fn weights(self) -> bool {
        !matches!(self, GradTracking::Disabled)
    }

    pub fn inputs(self) -> bool {
        matches!(self, GradTracking::WeightsAndInputs)
    }
}

pub trait Backend: Send + Sync {
    /// Run the graph over `inputs` (one tensor per graph input, batch axis first)
    fn build_forward_pass(
        &self,
        graph: &Graph,
        inputs: &[ArrayD<f32>],
        tracking: GradTracking,
    ) -> Result<ForwardPass>;
}
