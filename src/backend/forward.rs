use crate::autograd::Tensor;
use crate::error::{Error, Result};
use crate::graph::NodeId;
use std::collections::HashMap;

/// Differentiable forward instance of a graph over one input batch
///
/// Holds the retained tape: every node output and every parameter leaf stays
/// alive until the pass is dropped, so the same pass can be differentiated
/// repeatedly.
pub struct ForwardPass {
    node_outputs: Vec<Vec<Tensor>>,
    parameters: HashMap<(NodeId, String), Tensor>,
    owners: Vec<NodeId>,
    names: Vec<String>,
    outputs: Vec<Tensor>,
}

impl ForwardPass {
    pub(crate) fn new(
        node_outputs: Vec<Vec<Tensor>>,
        parameters: HashMap<(NodeId, String), Tensor>,
        owners: Vec<NodeId>,
        names: Vec<String>,
        outputs: Vec<Tensor>,
    ) -> Self {
        Self {
            node_outputs,
            parameters,
            owners,
            names,
            outputs,
        }
    }

    /// Model outputs, in graph output order
    pub fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    /// Output tensor `port` of `node`
    pub fn node_output(&self, node: NodeId, port: usize) -> Result<&Tensor> {
        self.node_outputs
            .get(node.0)
            .ok_or_else(|| Error::NodeNotFound(node.to_string()))?
            .get(port)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "node '{}' has no output port {port}",
                    self.name(node)
                ))
            })
    }

    /// Parameter leaf of `node`; reused occurrences resolve to their owner
    pub fn parameter(&self, node: NodeId, attribute: &str) -> Result<&Tensor> {
        let owner = *self
            .owners
            .get(node.0)
            .ok_or_else(|| Error::NodeNotFound(node.to_string()))?;
        self.parameters
            .get(&(owner, attribute.to_string()))
            .ok_or_else(|| Error::MissingWeight {
                node: self.name(node).to_string(),
                attribute: attribute.to_string(),
            })
    }

    fn name(&self, node: NodeId) -> &str {
        self.names.get(node.0).map(String::as_str).unwrap_or("?")
    }
}

impl std::fmt::Debug for ForwardPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardPass")
            .field("nodes", &self.names)
            .field("parameters", &self.parameters.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}
