//! YAML schema of a sensitivity run

use crate::analyzer::QuantizationConfig;
use crate::hessian::HessianConfig;
use serde::{Deserialize, Serialize};

/// Complete run specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Float model description
    pub model: ModelSpec,

    /// Representative data
    #[serde(default)]
    pub dataset: DatasetSpec,

    /// Trace estimator constants
    #[serde(default)]
    pub hessian: HessianConfig,

    #[serde(default)]
    pub quantization: QuantizationConfig,
}

/// Model inputs, layers and outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Seed of the weight initializer
    #[serde(default)]
    pub seed: u64,

    pub inputs: Vec<InputSpec>,

    pub layers: Vec<LayerSpec>,

    /// Tensor references (`name` or `name:port`)
    pub outputs: Vec<String>,
}

/// Model input; `shape` excludes the batch axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

/// One layer
///
/// Either a new layer, with an `op` tag and its parameters inline, or a
/// `reuse: <layer>` occurrence of an earlier layer's weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,

    /// Tensor references (`name` or `name:port`)
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reuse: Option<String>,

    /// `op` and its parameters; parsed into [`crate::graph::Op`] when the graph is built
    #[serde(flatten)]
    pub params: serde_yaml::Mapping,
}

fn default_batch_size() -> usize {
    1
}

/// Representative data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSpec {
    /// Seeded standard-normal batches shaped like the model inputs
    RandomNormal {
        #[serde(default = "default_batch_size")]
        batch_size: usize,
        /// Unbounded when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_batches: Option<usize>,
        /// Falls back to the model seed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },
}

impl Default for DatasetSpec {
    fn default() -> Self {
        DatasetSpec::RandomNormal {
            batch_size: default_batch_size(),
            num_batches: None,
            seed: None,
        }
    }
}

/// Split a tensor reference into node name and output port
pub fn parse_tensor_ref(reference: &str) -> Option<(&str, usize)> {
    match reference.rsplit_once(':') {
        Some((name, port)) => {
            let port = port.parse().ok()?;
            (!name.is_empty()).then_some((name, port))
        }
        None => (!reference.is_empty()).then_some((reference, 0)),
    }
}
