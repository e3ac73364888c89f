//! Framework info: how each operator kind is treated by quantization
//!
//! Operator kinds are split into three groups (kernel, activation,
//! no-quantization). [`FrameworkInfoBuilder::build`] checks that the groups are
//! mutually exclusive and together cover [`OpType::ALL`], so a kind can never be
//! silently misclassified.

mod default_info;

pub use default_info::{default_framework_info, DEFAULT_ACTIVATION_CHANNEL_AXIS};

use crate::error::{Error, Result};
use crate::graph::{Node, OpType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Quantization treatment of an operator kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpGroup {
    /// Has coefficients that get quantized
    Kernel,
    /// Output activations get quantized
    Activation,
    /// Left in float
    NoQuantization,
}

impl fmt::Display for OpGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpGroup::Kernel => "kernel",
            OpGroup::Activation => "activation",
            OpGroup::NoQuantization => "no_quantization",
        })
    }
}

/// Output/input channel axes of a kernel tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelChannels {
    pub out_axis: usize,
    pub in_axis: usize,
}

/// Static, read-only operator tables
#[derive(Clone, Debug)]
pub struct FrameworkInfo {
    kernel_ops: BTreeSet<OpType>,
    activation_ops: BTreeSet<OpType>,
    no_quantization_ops: BTreeSet<OpType>,
    kernel_channels: BTreeMap<OpType, KernelChannels>,
    kernel_attributes: BTreeMap<OpType, Vec<String>>,
    activation_channel_axis: BTreeMap<OpType, isize>,
    layer_min_max: BTreeMap<OpType, (f32, f32)>,
}

impl Default for FrameworkInfo {
    fn default() -> Self {
        default_framework_info().clone()
    }
}

impl FrameworkInfo {
    pub fn builder() -> FrameworkInfoBuilder {
        FrameworkInfoBuilder::default()
    }

    pub fn in_kernel_ops(&self, node: &Node) -> bool {
        self.kernel_ops.contains(&node.op_type())
    }

    pub fn in_activation_ops(&self, node: &Node) -> bool {
        self.activation_ops.contains(&node.op_type())
    }

    pub fn in_no_quantization_ops(&self, node: &Node) -> bool {
        self.no_quantization_ops.contains(&node.op_type())
    }

    /// Whether the operator's output range is known without statistics
    pub fn layers_has_min_max(&self, op_type: OpType) -> bool {
        self.layer_min_max.contains_key(&op_type)
    }

    pub fn layer_min_max(&self, op_type: OpType) -> Option<(f32, f32)> {
        self.layer_min_max.get(&op_type).copied()
    }

    pub fn group(&self, op_type: OpType) -> Option<OpGroup> {
        if self.kernel_ops.contains(&op_type) {
            Some(OpGroup::Kernel)
        } else if self.activation_ops.contains(&op_type) {
            Some(OpGroup::Activation)
        } else if self.no_quantization_ops.contains(&op_type) {
            Some(OpGroup::NoQuantization)
        } else {
            None
        }
    }

    pub fn kernel_channels(&self, op_type: OpType) -> Option<KernelChannels> {
        self.kernel_channels.get(&op_type).copied()
    }

    /// Names of the learnable weights the kernel group quantizes for `op_type`
    pub fn kernel_attributes(&self, op_type: OpType) -> &[String] {
        self.kernel_attributes
            .get(&op_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Channel axis of the operator's output activation (negative counts from the end)
    pub fn activation_channel_axis(&self, op_type: OpType) -> isize {
        self.activation_channel_axis
            .get(&op_type)
            .copied()
            .unwrap_or(DEFAULT_ACTIVATION_CHANNEL_AXIS)
    }

    /// Check group exclusivity and totality plus kernel metadata consistency
    pub fn validate(&self) -> Result<()> {
        for op_type in OpType::ALL {
            let memberships = [
                &self.kernel_ops,
                &self.activation_ops,
                &self.no_quantization_ops,
            ]
            .iter()
            .filter(|group| group.contains(&op_type))
            .count();
            match memberships {
                0 => {
                    return Err(Error::ConfigError(format!(
                        "operator {op_type} is not assigned to any quantization group"
                    )))
                }
                1 => {}
                _ => {
                    return Err(Error::ConfigError(format!(
                        "operator {op_type} is assigned to more than one quantization group"
                    )))
                }
            }
        }

        for &op_type in &self.kernel_ops {
            let channels = self.kernel_channels(op_type).ok_or_else(|| {
                Error::ConfigError(format!("kernel operator {op_type} has no channels mapping"))
            })?;
            if self.kernel_attributes(op_type).is_empty() {
                return Err(Error::ConfigError(format!(
                    "kernel operator {op_type} has no weight attributes"
                )));
            }
            if let Some(rank) = op_type.kernel_rank() {
                if channels.out_axis >= rank || channels.in_axis >= rank {
                    return Err(Error::ConfigError(format!(
                        "channel axes {channels:?} of {op_type} exceed kernel rank {rank}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for custom framework tables
#[derive(Debug, Default)]
pub struct FrameworkInfoBuilder {
    info: FrameworkInfoParts,
}

#[derive(Debug, Default)]
struct FrameworkInfoParts {
    kernel_ops: BTreeSet<OpType>,
    activation_ops: BTreeSet<OpType>,
    no_quantization_ops: BTreeSet<OpType>,
    kernel_channels: BTreeMap<OpType, KernelChannels>,
    kernel_attributes: BTreeMap<OpType, Vec<String>>,
    activation_channel_axis: BTreeMap<OpType, isize>,
    layer_min_max: BTreeMap<OpType, (f32, f32)>,
}

impl FrameworkInfoBuilder {
    /// Start from the default tables
    pub fn from_default() -> Self {
        let d = default_framework_info();
        Self {
            info: FrameworkInfoParts {
                kernel_ops: d.kernel_ops.clone(),
                activation_ops: d.activation_ops.clone(),
                no_quantization_ops: d.no_quantization_ops.clone(),
                kernel_channels: d.kernel_channels.clone(),
                kernel_attributes: d.kernel_attributes.clone(),
                activation_channel_axis: d.activation_channel_axis.clone(),
                layer_min_max: d.layer_min_max.clone(),
            },
        }
    }

    pub fn kernel_ops(mut self, ops: impl IntoIterator<Item = OpType>) -> Self {
        self.info.kernel_ops = ops.into_iter().collect();
        self
    }

    pub fn activation_ops(mut self, ops: impl IntoIterator<Item = OpType>) -> Self {
        self.info.activation_ops = ops.into_iter().collect();
        self
    }

    pub fn no_quantization_ops(mut self, ops: impl IntoIterator<Item = OpType>) -> Self {
        self.info.no_quantization_ops = ops.into_iter().collect();
        self
    }

    pub fn kernel_channels(mut self, op_type: OpType, out_axis: usize, in_axis: usize) -> Self {
        self.info
            .kernel_channels
            .insert(op_type, KernelChannels { out_axis, in_axis });
        self
    }

    pub fn kernel_attributes<S: Into<String>>(
        mut self,
        op_type: OpType,
        attributes: impl IntoIterator<Item = S>,
    ) -> Self {
        self.info
            .kernel_attributes
            .insert(op_type, attributes.into_iter().map(Into::into).collect());
        self
    }

    pub fn activation_channel_axis(mut self, op_type: OpType, axis: isize) -> Self {
        self.info.activation_channel_axis.insert(op_type, axis);
        self
    }

    pub fn layer_min_max(mut self, op_type: OpType, min: f32, max: f32) -> Self {
        self.info.layer_min_max.insert(op_type, (min, max));
        self
    }

    pub fn build(self) -> Result<FrameworkInfo> {
        let p = self.info;
        let info = FrameworkInfo {
            kernel_ops: p.kernel_ops,
            activation_ops: p.activation_ops,
            no_quantization_ops: p.no_quantization_ops,
            kernel_channels: p.kernel_channels,
            kernel_attributes: p.kernel_attributes,
            activation_channel_axis: p.activation_channel_axis,
            layer_min_max: p.layer_min_max,
        };
        info.validate()?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Op;

    #[test]
    fn test_default_info_is_valid() {
        default_framework_info().validate().unwrap();
    }

    #[test]
    fn test_default_groups() {
        let info = FrameworkInfo::default();
        let conv = Node::new("c", Op::Conv2d {
            filters: 1,
            kernel_size: [1, 1],
            strides: [1, 1],
            padding: crate::autograd::Padding::Valid,
        });
        let reshape = Node::new("r", Op::Reshape { shape: vec![-1] });
        let relu = Node::new("a", Op::Relu { max_value: None });

        assert!(info.in_kernel_ops(&conv));
        assert!(!info.in_activation_ops(&conv));
        assert!(info.in_no_quantization_ops(&reshape));
        assert!(info.in_activation_ops(&relu));
        assert_eq!(info.group(OpType::Flatten), Some(OpGroup::NoQuantization));
        assert_eq!(info.kernel_attributes(OpType::DepthwiseConv2d), ["depthwise_kernel"]);
        assert_eq!(info.kernel_channels(OpType::Conv2d).unwrap().out_axis, 3);
        assert_eq!(info.kernel_channels(OpType::Dense).unwrap().out_axis, 1);
        assert!(info.layers_has_min_max(OpType::Softmax));
        assert!(!info.layers_has_min_max(OpType::Conv2d));
        assert_eq!(info.activation_channel_axis(OpType::Add), -1);
    }

    #[test]
    fn test_builder_rejects_overlapping_groups() {
        let err = FrameworkInfoBuilder::from_default()
            .activation_ops([
                OpType::Input,
                OpType::BatchNorm,
                OpType::Relu,
                OpType::Softmax,
                OpType::Add,
                OpType::Dense,
            ])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn test_builder_rejects_unassigned_operator() {
        let err = FrameworkInfoBuilder::from_default()
            .no_quantization_ops([OpType::Split, OpType::Flatten])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Reshape"));
    }

    #[test]
    fn test_builder_rejects_axis_out_of_rank() {
        let err = FrameworkInfoBuilder::from_default()
            .kernel_channels(OpType::Dense, 2, 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_builder_accepts_multi_weight_mapping() {
        let info = FrameworkInfoBuilder::from_default()
            .kernel_attributes(OpType::Dense, ["kernel", "bias"])
            .build()
            .unwrap();
        assert_eq!(info.kernel_attributes(OpType::Dense).len(), 2);
    }
}
