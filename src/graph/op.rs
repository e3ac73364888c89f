//! Operator kinds and their parameters

use crate::autograd::Padding;
use serde::{Deserialize, Serialize};
use std::fmt;

fn unit_strides() -> [usize; 2] {
    [1, 1]
}

fn one() -> usize {
    1
}

fn default_bn_epsilon() -> f32 {
    1e-3
}

/// A graph operator together with its hyper-parameters
///
/// Shapes exclude the batch axis; tensors are channels-last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Model input with per-sample shape
    Input { shape: Vec<usize> },
    /// Fully-connected layer over the last axis
    Dense { units: usize },
    Conv2d {
        filters: usize,
        kernel_size: [usize; 2],
        #[serde(default = "unit_strides")]
        strides: [usize; 2],
        #[serde(default)]
        padding: Padding,
    },
    DepthwiseConv2d {
        kernel_size: [usize; 2],
        #[serde(default = "unit_strides")]
        strides: [usize; 2],
        #[serde(default)]
        padding: Padding,
        #[serde(default = "one")]
        depth_multiplier: usize,
    },
    Conv2dTranspose {
        filters: usize,
        kernel_size: [usize; 2],
        #[serde(default = "unit_strides")]
        strides: [usize; 2],
        #[serde(default)]
        padding: Padding,
    },
    /// Inference-mode batch normalization over the last axis
    BatchNorm {
        #[serde(default = "default_bn_epsilon")]
        epsilon: f32,
    },
    Relu {
        #[serde(default)]
        max_value: Option<f32>,
    },
    Softmax,
    /// Element-wise sum of two or more inputs
    Add,
    /// Equal split of the last axis into `num_splits` outputs
    Split { num_splits: usize },
    Flatten,
    /// Per-sample target shape; at most one entry may be `-1`
    Reshape { shape: Vec<isize> },
}

impl Op {
    pub fn op_type(&self) -> OpType {
        match self {
            Op::Input { .. } => OpType::Input,
            Op::Dense { .. } => OpType::Dense,
            Op::Conv2d { .. } => OpType::Conv2d,
            Op::DepthwiseConv2d { .. } => OpType::DepthwiseConv2d,
            Op::Conv2dTranspose { .. } => OpType::Conv2dTranspose,
            Op::BatchNorm { .. } => OpType::BatchNorm,
            Op::Relu { .. } => OpType::Relu,
            Op::Softmax => OpType::Softmax,
            Op::Add => OpType::Add,
            Op::Split { .. } => OpType::Split,
            Op::Flatten => OpType::Flatten,
            Op::Reshape { .. } => OpType::Reshape,
        }
    }

    /// Number of output tensors the operator produces
    pub fn num_outputs(&self) -> usize {
        match self {
            Op::Split { num_splits } => *num_splits,
            _ => 1,
        }
    }

    /// `(kernel_size, strides)` of the convolution variants
    pub fn window(&self) -> Option<([usize; 2], [usize; 2])> {
        match self {
            Op::Conv2d { kernel_size, strides, .. }
            | Op::DepthwiseConv2d { kernel_size, strides, .. }
            | Op::Conv2dTranspose { kernel_size, strides, .. } => Some((*kernel_size, *strides)),
            _ => None,
        }
    }

    /// Accepted number of inputs as an inclusive range
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Op::Input { .. } => (0, 0),
            Op::Add => (2, usize::MAX),
            _ => (1, 1),
        }
    }
}

/// Closed set of operator kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Input,
    Dense,
    Conv2d,
    DepthwiseConv2d,
    Conv2dTranspose,
    BatchNorm,
    Relu,
    Softmax,
    Add,
    Split,
    Flatten,
    Reshape,
}

impl OpType {
    pub const ALL: [OpType; 12] = [
        OpType::Input,
        OpType::Dense,
        OpType::Conv2d,
        OpType::DepthwiseConv2d,
        OpType::Conv2dTranspose,
        OpType::BatchNorm,
        OpType::Relu,
        OpType::Softmax,
        OpType::Add,
        OpType::Split,
        OpType::Flatten,
        OpType::Reshape,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OpType::Input => "Input",
            OpType::Dense => "Dense",
            OpType::Conv2d => "Conv2D",
            OpType::DepthwiseConv2d => "DepthwiseConv2D",
            OpType::Conv2dTranspose => "Conv2DTranspose",
            OpType::BatchNorm => "BatchNormalization",
            OpType::Relu => "ReLU",
            OpType::Softmax => "Softmax",
            OpType::Add => "Add",
            OpType::Split => "Split",
            OpType::Flatten => "Flatten",
            OpType::Reshape => "Reshape",
        }
    }

    /// Rank of the main weight tensor, if the operator has one
    pub fn kernel_rank(self) -> Option<usize> {
        match self {
            OpType::Dense => Some(2),
            OpType::Conv2d | OpType::DepthwiseConv2d | OpType::Conv2dTranspose => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
