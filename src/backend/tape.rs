//! Reference backend: executes the graph on the autograd tape

use super::{Backend, ForwardPass, GradTracking};
use crate::autograd::{
    add, batch_norm, conv2d, conv2d_transpose, dense, depthwise_conv2d, relu_clipped, reshape,
    softmax, split_last, Tensor,
};
use crate::error::{Error, Result};
use crate::graph::{Graph, Node, NodeId, Op};
use ndarray::ArrayD;
use std::collections::HashMap;

/// Builds forward passes with the in-crate autograd engine
#[derive(Clone, Copy, Debug, Default)]
pub struct TapeBackend;

impl TapeBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Weights that are statistics rather than learnable parameters
const FROZEN_ATTRIBUTES: [&str; 2] = ["moving_mean", "moving_variance"];

impl Backend for TapeBackend {
    fn build_forward_pass(
        &self,
        graph: &Graph,
        inputs: &[ArrayD<f32>],
        tracking: GradTracking,
    ) -> Result<ForwardPass> {
        check_inputs(graph, inputs)?;

        let owners = (0..graph.len())
            .map(|i| graph.weight_owner(NodeId(i)))
            .collect::<Result<Vec<_>>>()?;

        let mut parameters = HashMap::new();
        for (i, node) in graph.nodes().iter().enumerate() {
            if owners[i] != NodeId(i) {
                continue;
            }
            for (attribute, value) in &node.weights {
                let learnable = !FROZEN_ATTRIBUTES.contains(&attribute.as_str());
                let leaf = Tensor::new(value.as_ref().clone(), tracking.weights() && learnable);
                parameters.insert((NodeId(i), attribute.clone()), leaf);
            }
        }

        let mut node_outputs: Vec<Vec<Tensor>> = vec![Vec::new(); graph.len()];
        for (id, node) in graph.topo_sorted_nodes() {
            let args: Vec<Tensor> = graph
                .incoming_edges(id)
                .iter()
                .map(|e| node_outputs[e.source.0][e.source_port].clone())
                .collect();
            let param = |attribute: &str| {
                parameters
                    .get(&(owners[id.0], attribute.to_string()))
                    .ok_or_else(|| Error::MissingWeight {
                        node: node.name.clone(),
                        attribute: attribute.to_string(),
                    })
            };
            node_outputs[id.0] = execute(graph, id, node, &args, inputs, tracking, &param)?;
        }

        let outputs = graph
            .outputs()
            .iter()
            .map(|o| node_outputs[o.node.0][o.port].clone())
            .collect();
        let names = graph.nodes().iter().map(|n| n.name.clone()).collect();

        Ok(ForwardPass::new(node_outputs, parameters, owners, names, outputs))
    }
}

fn check_inputs(graph: &Graph, inputs: &[ArrayD<f32>]) -> Result<()> {
    if inputs.len() != graph.inputs().len() {
        return Err(Error::InvalidParameter(format!(
            "model has {} input(s) but {} tensor(s) were provided",
            graph.inputs().len(),
            inputs.len()
        )));
    }
    for (&id, tensor) in graph.inputs().iter().zip(inputs) {
        if let Op::Input { shape } = &graph.node(id).op {
            if tensor.ndim() != shape.len() + 1 || &tensor.shape()[1..] != shape.as_slice() {
                let mut expected = vec![tensor.shape().first().copied().unwrap_or(0)];
                expected.extend(shape);
                return Err(Error::ShapeMismatch {
                    expected,
                    got: tensor.shape().to_vec(),
                });
            }
        }
    }
    Ok(())
}

fn execute<'p, F>(
    graph: &Graph,
    id: NodeId,
    node: &Node,
    args: &[Tensor],
    inputs: &[ArrayD<f32>],
    tracking: GradTracking,
    param: &F,
) -> Result<Vec<Tensor>>
where
    F: Fn(&str) -> Result<&'p Tensor>,
{
    let x = args.first();
    let first = || {
        x.ok_or_else(|| Error::InvalidGraph(format!("node '{}' has no input", node.name)))
    };
    let bias = || param("bias").ok();
    let batch = |t: &Tensor| t.shape().first().copied().unwrap_or(0) as isize;

    let out = match &node.op {
        Op::Input { .. } => {
            let position = graph
                .inputs()
                .iter()
                .position(|&i| i == id)
                .ok_or_else(|| Error::NodeNotFound(node.name.clone()))?;
            Tensor::new(inputs[position].clone(), tracking.inputs())
        }
        Op::Dense { .. } => dense(first()?, param("kernel")?, bias())?,
        Op::Conv2d { strides, padding, .. } => {
            conv2d(first()?, param("kernel")?, bias(), *strides, *padding)?
        }
        Op::DepthwiseConv2d { strides, padding, .. } => {
            depthwise_conv2d(first()?, param("depthwise_kernel")?, bias(), *strides, *padding)?
        }
        Op::Conv2dTranspose { strides, padding, .. } => {
            conv2d_transpose(first()?, param("kernel")?, bias(), *strides, *padding)?
        }
        Op::BatchNorm { epsilon } => batch_norm(
            first()?,
            param("gamma")?,
            param("beta")?,
            param("moving_mean")?.data(),
            param("moving_variance")?.data(),
            *epsilon,
        )?,
        Op::Relu { max_value } => relu_clipped(first()?, *max_value),
        Op::Softmax => softmax(first()?),
        Op::Add => {
            let (head, rest) = args
                .split_first()
                .ok_or_else(|| Error::InvalidGraph(format!("Add '{}' has no inputs", node.name)))?;
            rest.iter().try_fold(head.clone(), |acc, t| add(&acc, t))?
        }
        Op::Split { num_splits } => return split_last(first()?, *num_splits),
        Op::Flatten => {
            let x = first()?;
            reshape(x, &[batch(x), -1])?
        }
        Op::Reshape { shape } => {
            let x = first()?;
            let mut target = vec![batch(x)];
            target.extend(shape);
            reshape(x, &target)?
        }
    };
    Ok(vec![out])
}
