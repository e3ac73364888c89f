//! Statistics-collector assignment
//!
//! [`analyzer_graph`] walks a graph in topological order and attaches a
//! [`StatsCollector`] to each node's output. [`collect_statistics`] then feeds
//! representative batches through the float model into those collectors.

mod stats;

pub use stats::StatsContainer;

use crate::backend::{Backend, GradTracking};
use crate::error::Result;
use crate::framework::{FrameworkInfo, OpGroup};
use crate::graph::{Graph, Node, NodeId};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_true() -> bool {
    true
}

/// Quantization options the analyzer depends on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Kernel nodes need statistics on their inputs to correct the bias shift
    #[serde(default = "default_true")]
    pub weights_bias_correction: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            weights_bias_correction: true,
        }
    }
}

/// Output-statistics slot of a node
#[derive(Clone, Debug, PartialEq)]
pub enum StatsCollector {
    Stats(StatsContainer),
    /// Output is never quantized, or its range is known up front
    NoStats,
}

impl StatsCollector {
    pub fn fresh() -> Self {
        StatsCollector::Stats(StatsContainer::new())
    }

    pub fn container(&self) -> Option<&StatsContainer> {
        match self {
            StatsCollector::Stats(stats) => Some(stats),
            StatsCollector::NoStats => None,
        }
    }
}

/// Default per-node analysis
pub fn create_stats_for_node(node: &Node, fw_info: &FrameworkInfo) -> Option<StatsCollector> {
    let op_type = node.op_type();
    match fw_info.group(op_type)? {
        OpGroup::NoQuantization => Some(StatsCollector::NoStats),
        _ if fw_info.layers_has_min_max(op_type) => Some(StatsCollector::NoStats),
        OpGroup::Kernel | OpGroup::Activation => Some(StatsCollector::fresh()),
    }
}

/// Attach a collector to every node, as chosen by `node_analyze`
///
/// With bias correction on, each kernel node's predecessors get a real
/// container even if their own analysis returned none or `NoStats`.
pub fn analyzer_graph<F>(
    node_analyze: F,
    graph: &mut Graph,
    fw_info: &FrameworkInfo,
    qc: &QuantizationConfig,
) where
    F: Fn(&Node, &FrameworkInfo) -> Option<StatsCollector>,
{
    let order = graph.topological_order().to_vec();
    for id in order {
        let node = graph.node(id);
        let collector = node_analyze(node, fw_info);

        if qc.weights_bias_correction && fw_info.in_kernel_ops(node) {
            for source in graph.predecessors(id) {
                force_stats(graph, source);
            }
        }
        if let Some(collector) = collector {
            graph.set_out_stats_collector(id, collector);
        }
    }
}

fn force_stats(graph: &mut Graph, id: NodeId) {
    let missing = matches!(
        graph.get_out_stats_collector(id),
        None | Some(StatsCollector::NoStats)
    );
    if missing {
        graph.set_out_stats_collector(id, StatsCollector::fresh());
    }
}

/// Run one inference pass over `inputs` and update every node's container
///
/// Returns how many containers were updated.
pub fn collect_statistics(
    graph: &mut Graph,
    backend: &dyn Backend,
    inputs: &[ArrayD<f32>],
) -> Result<usize> {
    let pass = backend.build_forward_pass(graph, inputs, GradTracking::Disabled)?;
    let mut updated = 0;
    for i in 0..graph.len() {
        let id = NodeId(i);
        if let Some(StatsCollector::Stats(stats)) = graph.out_stats_collector_mut(id) {
            stats.observe_array(pass.node_output(id, 0)?.data());
            updated += 1;
        }
    }
    debug!(updated, "statistics collected");
    Ok(updated)
}
