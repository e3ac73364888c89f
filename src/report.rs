//! Sensitivity and graph reports for the CLI

use crate::error::{Error, Result};
use crate::framework::{FrameworkInfo, OpGroup};
use crate::graph::{Graph, NodeId};
use crate::hessian::{HessianInfoGranularity, HessianInfoService, HessianMode, TraceHessianRequest};
use ndarray::ArrayD;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Scores of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeSensitivity {
    pub node: String,
    pub op: String,
    /// Shape of every score
    pub shape: Vec<usize>,
    /// Element-wise mean over the scores
    pub mean: Vec<f32>,
    /// One flattened score per representative batch
    pub scores: Vec<Vec<f32>>,
}

impl NodeSensitivity {
    fn new(node: String, op: String, scores: &[ArrayD<f32>]) -> Self {
        let shape = scores.first().map(|s| s.shape().to_vec()).unwrap_or_default();
        let flat: Vec<Vec<f32>> = scores.iter().map(|s| s.iter().copied().collect()).collect();
        let len = flat.first().map_or(0, Vec::len);
        let mean = (0..len)
            .map(|i| flat.iter().map(|s| s[i]).sum::<f32>() / flat.len() as f32)
            .collect();
        Self {
            node,
            op,
            shape,
            mean,
            scores: flat,
        }
    }

    /// Sum of the mean score, comparable across granularities
    pub fn total(&self) -> f32 {
        self.mean.iter().sum()
    }
}

/// Scores for a set of nodes under one mode and granularity
#[derive(Debug, Clone, Serialize)]
pub struct SensitivityReport {
    pub mode: HessianMode,
    pub granularity: HessianInfoGranularity,
    pub num_scores: usize,
    pub nodes: Vec<NodeSensitivity>,
}

impl SensitivityReport {
    /// Node names ordered from most to least sensitive
    pub fn ranking(&self) -> Vec<(&str, f32)> {
        let mut ranked: Vec<(&str, f32)> =
            self.nodes.iter().map(|n| (n.node.as_str(), n.total())).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Fetch `num_scores` scores for each of `nodes` (in parallel) and collect them
pub fn build_report(
    service: &HessianInfoService,
    nodes: &[NodeId],
    mode: HessianMode,
    granularity: HessianInfoGranularity,
    num_scores: usize,
) -> Result<SensitivityReport> {
    let requests: Vec<TraceHessianRequest> = nodes
        .iter()
        .map(|&id| TraceHessianRequest::new(mode, granularity, id))
        .collect();
    let results = service.fetch_hessian_many(&requests, num_scores)?;

    let graph = service.graph();
    let nodes = nodes
        .iter()
        .zip(&results)
        .map(|(&id, scores)| {
            let node = graph.node(id);
            NodeSensitivity::new(node.name.clone(), node.op_type().to_string(), scores)
        })
        .collect();

    Ok(SensitivityReport {
        mode,
        granularity,
        num_scores,
        nodes,
    })
}

/// Values shown per node before eliding
const PREVIEW: usize = 6;

impl fmt::Display for SensitivityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Hessian trace w.r.t {} ({}, {} score(s) per node)",
            self.mode, self.granularity, self.num_scores
        )?;
        writeln!(f)?;
        for node in &self.nodes {
            writeln!(
                f,
                "{:<24} {:<22} shape={:?} total={:.6e}",
                node.node,
                node.op,
                node.shape,
                node.total()
            )?;
            if node.mean.len() > 1 {
                let preview: Vec<String> = node
                    .mean
                    .iter()
                    .take(PREVIEW)
                    .map(|v| format!("{v:.4e}"))
                    .collect();
                let more = if node.mean.len() > PREVIEW { ", ..." } else { "" };
                writeln!(f, "    mean: [{}{more}]", preview.join(", "))?;
            }
        }
        writeln!(f)?;
        writeln!(f, "Ranking:")?;
        for (i, (name, total)) in self.ranking().iter().enumerate() {
            writeln!(f, "{:>3}. {name} ({total:.6e})", i + 1)?;
        }
        Ok(())
    }
}

/// One row of `cuantizar info`
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub op: String,
    pub group: Option<OpGroup>,
    pub output_shapes: Vec<Vec<usize>>,
    pub weights: BTreeMap<String, Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reuse_group: Option<String>,
    pub reuse: bool,
}

/// Nodes of a graph in topological order
#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub nodes: Vec<NodeSummary>,
}

impl GraphSummary {
    pub fn from_graph(graph: &Graph, fw_info: &FrameworkInfo) -> Self {
        let nodes = graph
            .topo_sorted_nodes()
            .map(|(_, node)| NodeSummary {
                name: node.name.clone(),
                op: node.op_type().to_string(),
                group: fw_info.group(node.op_type()),
                output_shapes: node.output_shapes.clone(),
                weights: node
                    .weights
                    .iter()
                    .map(|(k, v)| (k.clone(), v.shape().to_vec()))
                    .collect(),
                reuse_group: node.reuse_group.clone(),
                reuse: node.reuse,
            })
            .collect();
        Self { nodes }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl fmt::Display for GraphSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            let group = node.group.map_or_else(|| "-".to_string(), |g| g.to_string());
            write!(f, "{:<24} {:<22} {:<16} out={:?}", node.name, node.op, group, node.output_shapes)?;
            for (attribute, shape) in &node.weights {
                write!(f, " {attribute}={shape:?}")?;
            }
            match (&node.reuse_group, node.reuse) {
                (Some(owner), true) => write!(f, " (reuses {owner})")?,
                (Some(_), false) => write!(f, " (shared)")?,
                _ => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::default_framework_info;
    use crate::graph::{GraphBuilder, Op};
    use crate::hessian::{FiniteDataset, HessianConfig};
    use approx::assert_abs_diff_eq;
    use ndarray::IxDyn;
    use std::sync::Arc;

    #[test]
    fn test_node_sensitivity_mean() {
        let scores = [
            ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 4.0]).unwrap(),
            ArrayD::from_shape_vec(IxDyn(&[2]), vec![3.0, 0.0]).unwrap(),
        ];
        let node = NodeSensitivity::new("d".into(), "Dense".into(), &scores);
        assert_eq!(node.shape, vec![2]);
        assert_eq!(node.mean, vec![2.0, 2.0]);
        assert_abs_diff_eq!(node.total(), 4.0);
    }

    #[test]
    fn test_report_end_to_end() {
        let mut b = GraphBuilder::new(1);
        let x = b.input("input", &[3]).unwrap();
        let first = b.layer("first", Op::Dense { units: 4 }, &[x.into()]).unwrap();
        let second = b.layer("second", Op::Dense { units: 2 }, &[first.into()]).unwrap();
        b.output(second);
        let graph = Arc::new(b.build().unwrap());

        let batches = (0..2)
            .map(|i| vec![ArrayD::from_elem(IxDyn(&[1, 3]), 0.5 + i as f32)])
            .collect();
        let service = HessianInfoService::new(graph, FiniteDataset::new(batches))
            .with_config(HessianConfig::default().with_seed(4))
            .unwrap();

        let report = build_report(
            &service,
            &[first, second],
            HessianMode::Weights,
            HessianInfoGranularity::PerOutputChannel,
            2,
        )
        .unwrap();
        assert_eq!(report.nodes.len(), 2);
        assert_eq!(report.nodes[0].shape, vec![4]);
        assert_eq!(report.nodes[0].scores.len(), 2);
        assert_eq!(report.ranking().len(), 2);

        let text = report.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("Ranking:"));
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["granularity"], "per_output_channel");
        assert_eq!(json["nodes"][1]["node"], "second");
    }

    #[test]
    fn test_graph_summary() {
        let mut b = GraphBuilder::new(1);
        let x = b.input("input", &[3]).unwrap();
        let d = b.layer("dense", Op::Dense { units: 3 }, &[x.into()]).unwrap();
        let r = b.reuse("dense_1", "dense", &[d.into()]).unwrap();
        b.output(r);
        let graph = b.build().unwrap();

        let summary = GraphSummary::from_graph(&graph, default_framework_info());
        assert_eq!(summary.nodes.len(), 3);
        assert_eq!(summary.nodes[1].group, Some(OpGroup::Kernel));
        assert_eq!(summary.nodes[1].weights["kernel"], vec![3, 3]);
        assert!(summary.nodes[2].reuse);
        assert!(summary.to_string().contains("(reuses dense)"));
        assert!(summary.to_json().unwrap().contains("\"kernel\""));
    }
}
