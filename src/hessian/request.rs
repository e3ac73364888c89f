//! What to compute: target node, mode and granularity

use crate::graph::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tensor the Hessian trace is taken with respect to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HessianMode {
    Weights,
    Activation,
}

impl fmt::Display for HessianMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HessianMode::Weights => "weights",
            HessianMode::Activation => "activation",
        })
    }
}

/// Axis-reduction policy of a score
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HessianInfoGranularity {
    /// One scalar, shape `(1,)`
    PerTensor,
    /// One value per output channel
    PerOutputChannel,
    /// Same shape as the target tensor
    PerElement,
}

impl fmt::Display for HessianInfoGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HessianInfoGranularity::PerTensor => "per_tensor",
            HessianInfoGranularity::PerOutputChannel => "per_output_channel",
            HessianInfoGranularity::PerElement => "per_element",
        })
    }
}

/// Immutable description of one sensitivity query
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceHessianRequest {
    mode: HessianMode,
    granularity: HessianInfoGranularity,
    target_node: NodeId,
}

impl TraceHessianRequest {
    pub fn new(mode: HessianMode, granularity: HessianInfoGranularity, target_node: NodeId) -> Self {
        Self {
            mode,
            granularity,
            target_node,
        }
    }

    pub fn mode(&self) -> HessianMode {
        self.mode
    }

    pub fn granularity(&self) -> HessianInfoGranularity {
        self.granularity
    }

    pub fn target_node(&self) -> NodeId {
        self.target_node
    }

    /// Same query against another node
    pub(crate) fn retarget(&self, target_node: NodeId) -> Self {
        Self { target_node, ..*self }
    }
}
