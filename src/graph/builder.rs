//! Incremental graph construction with shape inference and weight init

use super::{Edge, Graph, Node, NodeId, Op, OutTensor, Weights};
use crate::autograd::resolve_shape;
use crate::error::{Error, Result};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

impl NodeId {
    /// Output tensor `port` of this node
    pub fn out(self, port: usize) -> OutTensor {
        OutTensor { node: self, port }
    }
}

impl From<NodeId> for OutTensor {
    fn from(node: NodeId) -> Self {
        node.out(0)
    }
}

/// Builds a [`Graph`] layer by layer
///
/// Weights are drawn from a seeded Glorot-uniform initializer (biases and
/// batch-norm statistics start at their identity values), so the same seed
/// always yields the same model.
pub struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    outputs: Vec<OutTensor>,
    rng: StdRng,
}

impl GraphBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            outputs: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Add a model input with the given per-sample shape
    pub fn input(&mut self, name: &str, shape: &[usize]) -> Result<NodeId> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(Error::InvalidParameter(format!(
                "input '{name}' needs a non-empty shape with positive sizes, got {shape:?}"
            )));
        }
        self.push(name, Op::Input { shape: shape.to_vec() }, &[], None)
    }

    /// Add a layer with freshly initialized weights
    pub fn layer(&mut self, name: &str, op: Op, inputs: &[OutTensor]) -> Result<NodeId> {
        self.push(name, op, inputs, None)
    }

    /// Add another occurrence of `owner`, sharing its weights
    pub fn reuse(&mut self, name: &str, owner: &str, inputs: &[OutTensor]) -> Result<NodeId> {
        let owner_id = self.lookup(owner)?;
        if self.nodes[owner_id.0].reuse {
            return Err(Error::InvalidGraph(format!(
                "cannot reuse '{owner}': it is itself a reused occurrence"
            )));
        }
        let op = self.nodes[owner_id.0].op.clone();
        self.push(name, op, inputs, Some(owner_id))
    }

    /// Mark a tensor as model output
    pub fn output(&mut self, tensor: impl Into<OutTensor>) -> &mut Self {
        self.outputs.push(tensor.into());
        self
    }

    /// Replace a weight of `node` (and of every occurrence sharing it)
    pub fn set_weight(&mut self, node: NodeId, attribute: &str, value: ArrayD<f32>) -> Result<()> {
        let target = self
            .nodes
            .get(node.0)
            .ok_or_else(|| Error::NodeNotFound(node.to_string()))?;
        let current = target.weight(attribute).ok_or_else(|| Error::MissingWeight {
            node: target.name.clone(),
            attribute: attribute.to_string(),
        })?;
        if current.shape() != value.shape() {
            return Err(Error::ShapeMismatch {
                expected: current.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }

        let group = target.reuse_group.clone();
        let value = Arc::new(value);
        for (i, n) in self.nodes.iter_mut().enumerate() {
            let shared = group.is_some() && n.reuse_group == group;
            if i == node.0 || shared {
                n.weights.insert(attribute.to_string(), Arc::clone(&value));
            }
        }
        Ok(())
    }

    pub fn node_shape(&self, tensor: OutTensor) -> Option<&[usize]> {
        self.nodes
            .get(tensor.node.0)
            .and_then(|n| n.output_shapes.get(tensor.port))
            .map(Vec::as_slice)
    }

    pub fn build(self) -> Result<Graph> {
        Graph::new(self.nodes, self.edges, self.outputs)
    }

    fn lookup(&self, name: &str) -> Result<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(NodeId)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    fn push(
        &mut self,
        name: &str,
        op: Op,
        inputs: &[OutTensor],
        owner: Option<NodeId>,
    ) -> Result<NodeId> {
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(Error::InvalidGraph(format!("duplicate node name '{name}'")));
        }
        let input_shapes = inputs
            .iter()
            .map(|t| {
                self.node_shape(*t).map(<[usize]>::to_vec).ok_or_else(|| {
                    Error::InvalidGraph(format!("'{name}' consumes missing tensor {t:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (min, max) = op.arity();
        if input_shapes.len() < min || input_shapes.len() > max {
            return Err(Error::InvalidGraph(format!(
                "{} node '{name}' cannot take {} input(s)",
                op.op_type(),
                input_shapes.len()
            )));
        }

        let output_shapes = infer_output_shapes(name, &op, &input_shapes)?;
        let id = NodeId(self.nodes.len());
        let mut node = Node::new(name, op);

        match owner {
            Some(owner_id) => {
                let owner_in = self.owner_input_shape(owner_id);
                let this_in = input_shapes.first().and_then(|s| s.last()).copied();
                if owner_in.is_some() && owner_in != this_in {
                    return Err(Error::ShapeMismatch {
                        expected: owner_in.into_iter().collect(),
                        got: this_in.into_iter().collect(),
                    });
                }
                let owner_node = &mut self.nodes[owner_id.0];
                owner_node.reuse_group = Some(owner_node.name.clone());
                node.weights = owner_node.weights.clone();
                node.reuse = true;
                node.reuse_group = owner_node.reuse_group.clone();
            }
            None => {
                let in_shape = input_shapes.first().map(Vec::as_slice).unwrap_or(&[]);
                node.weights = self.init_weights(&node.op, in_shape)?;
            }
        }
        node.output_shapes = output_shapes;

        for (slot, tensor) in inputs.iter().enumerate() {
            self.edges.push(Edge {
                source: tensor.node,
                source_port: tensor.port,
                sink: id,
                sink_index: slot,
            });
        }
        self.nodes.push(node);
        Ok(id)
    }

    fn owner_input_shape(&self, owner: NodeId) -> Option<usize> {
        let edge = self
            .edges
            .iter()
            .find(|e| e.sink == owner && e.sink_index == 0)?;
        self.node_shape(edge.source.out(edge.source_port))
            .and_then(|s| s.last())
            .copied()
    }

    fn glorot(&mut self, shape: &[usize], fan_in: usize, fan_out: usize) -> Result<Arc<ArrayD<f32>>> {
        let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
        let len = shape.iter().product();
        let values = (0..len)
            .map(|_| self.rng.random_range(-limit..limit))
            .collect();
        Ok(Arc::new(ArrayD::from_shape_vec(IxDyn(shape), values)?))
    }

    fn init_weights(&mut self, op: &Op, in_shape: &[usize]) -> Result<Weights> {
        let channels = in_shape.last().copied().unwrap_or(0);
        let mut weights = Weights::new();
        let zeros = |n: usize| Arc::new(ArrayD::zeros(IxDyn(&[n])));
        let ones = |n: usize| Arc::new(ArrayD::ones(IxDyn(&[n])));

        match *op {
            Op::Dense { units } => {
                weights.insert("kernel".into(), self.glorot(&[channels, units], channels, units)?);
                weights.insert("bias".into(), zeros(units));
            }
            Op::Conv2d { filters, kernel_size: [kh, kw], .. } => {
                let area = kh * kw;
                let kernel = self.glorot(&[kh, kw, channels, filters], area * channels, area * filters)?;
                weights.insert("kernel".into(), kernel);
                weights.insert("bias".into(), zeros(filters));
            }
            Op::DepthwiseConv2d { kernel_size: [kh, kw], depth_multiplier, .. } => {
                let area = kh * kw;
                let kernel = self.glorot(
                    &[kh, kw, channels, depth_multiplier],
                    area * channels,
                    area * depth_multiplier,
                )?;
                weights.insert("depthwise_kernel".into(), kernel);
                weights.insert("bias".into(), zeros(channels * depth_multiplier));
            }
            Op::Conv2dTranspose { filters, kernel_size: [kh, kw], .. } => {
                let area = kh * kw;
                let kernel = self.glorot(&[kh, kw, filters, channels], area * channels, area * filters)?;
                weights.insert("kernel".into(), kernel);
                weights.insert("bias".into(), zeros(filters));
            }
            Op::BatchNorm { .. } => {
                weights.insert("gamma".into(), ones(channels));
                weights.insert("beta".into(), zeros(channels));
                weights.insert("moving_mean".into(), zeros(channels));
                weights.insert("moving_variance".into(), ones(channels));
            }
            _ => {}
        }
        Ok(weights)
    }
}

/// Per-sample output shapes of `op` applied to `inputs`
pub(crate) fn infer_output_shapes(name: &str, op: &Op, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
    let first = inputs.first().cloned().unwrap_or_default();
    let last = first.last().copied().unwrap_or(0);
    let spatial = |what: &str| -> Result<(usize, usize)> {
        match first.as_slice() {
            [h, w, _] => Ok((*h, *w)),
            _ => Err(Error::InvalidGraph(format!(
                "{what} '{name}' expects (height, width, channels) inputs, got {first:?}"
            ))),
        }
    };
    let non_empty = |h: usize, w: usize| -> Result<()> {
        if h == 0 || w == 0 {
            return Err(Error::InvalidGraph(format!(
                "'{name}' produces an empty output from input {first:?}"
            )));
        }
        Ok(())
    };

    if let Some((kernel_size, strides)) = op.window() {
        if kernel_size.contains(&0) || strides.contains(&0) {
            return Err(Error::InvalidGraph(format!(
                "'{name}' needs a positive kernel size and strides, got {kernel_size:?} and {strides:?}"
            )));
        }
    }

    let shape = match op {
        Op::Input { shape } => shape.clone(),
        Op::Dense { units } => {
            if first.is_empty() {
                return Err(Error::InvalidGraph(format!("Dense '{name}' needs a ranked input")));
            }
            let mut out = first.clone();
            if let Some(l) = out.last_mut() {
                *l = *units;
            }
            out
        }
        Op::Conv2d { filters, kernel_size, strides, padding } => {
            let (h, w) = spatial("Conv2D")?;
            let (oh, _) = padding.conv_output(h, kernel_size[0], strides[0]);
            let (ow, _) = padding.conv_output(w, kernel_size[1], strides[1]);
            non_empty(oh, ow)?;
            vec![oh, ow, *filters]
        }
        Op::DepthwiseConv2d { kernel_size, strides, padding, depth_multiplier } => {
            let (h, w) = spatial("DepthwiseConv2D")?;
            let (oh, _) = padding.conv_output(h, kernel_size[0], strides[0]);
            let (ow, _) = padding.conv_output(w, kernel_size[1], strides[1]);
            non_empty(oh, ow)?;
            vec![oh, ow, last * depth_multiplier]
        }
        Op::Conv2dTranspose { filters, kernel_size, strides, padding } => {
            let (h, w) = spatial("Conv2DTranspose")?;
            let (oh, _) = padding.conv_transpose_output(h, kernel_size[0], strides[0]);
            let (ow, _) = padding.conv_transpose_output(w, kernel_size[1], strides[1]);
            non_empty(oh, ow)?;
            vec![oh, ow, *filters]
        }
        Op::BatchNorm { .. } | Op::Relu { .. } | Op::Softmax => first.clone(),
        Op::Add => {
            if let Some(other) = inputs.iter().find(|s| **s != first) {
                return Err(Error::ShapeMismatch {
                    expected: first.clone(),
                    got: other.clone(),
                });
            }
            first.clone()
        }
        Op::Split { num_splits } => {
            if *num_splits == 0 || last % num_splits != 0 {
                return Err(Error::InvalidGraph(format!(
                    "Split '{name}' cannot divide {last} channels into {num_splits} parts"
                )));
            }
            let mut part = first.clone();
            if let Some(l) = part.last_mut() {
                *l = last / num_splits;
            }
            return Ok(vec![part; *num_splits]);
        }
        Op::Flatten => vec![first.iter().product()],
        Op::Reshape { shape } => resolve_shape(shape, first.iter().product())?,
    };
    Ok(vec![shape])
}
