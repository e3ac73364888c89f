//! Default operator tables for channels-last models

use super::{FrameworkInfo, KernelChannels};
use crate::graph::OpType;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Activations are channels-last
pub const DEFAULT_ACTIVATION_CHANNEL_AXIS: isize = -1;

static DEFAULT_FRAMEWORK_INFO: LazyLock<FrameworkInfo> = LazyLock::new(|| {
    use OpType::*;

    let kernel_channels = BTreeMap::from([
        (Dense, KernelChannels { out_axis: 1, in_axis: 0 }),
        (Conv2d, KernelChannels { out_axis: 3, in_axis: 2 }),
        (DepthwiseConv2d, KernelChannels { out_axis: 2, in_axis: 3 }),
        (Conv2dTranspose, KernelChannels { out_axis: 2, in_axis: 3 }),
    ]);
    let kernel_attributes = BTreeMap::from([
        (Dense, vec!["kernel".to_string()]),
        (Conv2d, vec!["kernel".to_string()]),
        (DepthwiseConv2d, vec!["depthwise_kernel".to_string()]),
        (Conv2dTranspose, vec!["kernel".to_string()]),
    ]);

    FrameworkInfo {
        kernel_ops: BTreeSet::from([Dense, Conv2d, DepthwiseConv2d, Conv2dTranspose]),
        activation_ops: BTreeSet::from([Input, BatchNorm, Relu, Softmax, Add]),
        no_quantization_ops: BTreeSet::from([Split, Flatten, Reshape]),
        kernel_channels,
        kernel_attributes,
        activation_channel_axis: BTreeMap::new(),
        layer_min_max: BTreeMap::from([(Softmax, (0.0, 1.0)), (Relu, (0.0, f32::INFINITY))]),
    }
});

/// Shared default tables
pub fn default_framework_info() -> &'static FrameworkInfo {
    &DEFAULT_FRAMEWORK_INFO
}
