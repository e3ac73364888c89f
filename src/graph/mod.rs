//! Graph IR
//!
//! A validated DAG of operator nodes. Nodes are stored in insertion order and
//! addressed by [`NodeId`]; the topological order is computed once at
//! construction with Kahn's algorithm (ties broken by insertion order).

mod builder;
mod op;


pub use builder::GraphBuilder;
pub use op::{Op, OpType};

use crate::analyzer::StatsCollector;
use crate::error::{Error, Result};
use ndarray::ArrayD;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Index of a node inside its [`Graph`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Weight tensors of a node, keyed by attribute name
///
/// Reused nodes hold clones of the owner's `Arc`s, so storage is shared.
pub type Weights = BTreeMap<String, Arc<ArrayD<f32>>>;

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub weights: Weights,
    /// Per-sample output shapes, one per output port
    pub output_shapes: Vec<Vec<usize>>,
    /// True for every occurrence of a shared layer except its owner
    pub reuse: bool,
    /// Name of the owning occurrence for shared layers
    pub reuse_group: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: Op) -> Self {
        Self {
            name: name.into(),
            op,
            weights: Weights::new(),
            output_shapes: Vec::new(),
            reuse: false,
            reuse_group: None,
        }
    }

    pub fn op_type(&self) -> OpType {
        self.op.op_type()
    }

    pub fn weight(&self, attribute: &str) -> Option<&Arc<ArrayD<f32>>> {
        self.weights.get(attribute)
    }

    pub fn num_outputs(&self) -> usize {
        self.op.num_outputs()
    }
}

/// Data dependency from `source:source_port` into input slot `sink_index` of `sink`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    pub source: NodeId,
    pub source_port: usize,
    pub sink: NodeId,
    pub sink_index: usize,
}

/// One output tensor of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutTensor {
    pub node: NodeId,
    pub port: usize,
}

#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    inputs: Vec<NodeId>,
    outputs: Vec<OutTensor>,
    topo_order: Vec<NodeId>,
    stats: Vec<Option<StatsCollector>>,
}

impl Graph {
    /// Validate and assemble a graph
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>, outputs: Vec<OutTensor>) -> Result<Self> {
        let n = nodes.len();
        let mut names = HashSet::new();
        for node in &nodes {
            if !names.insert(node.name.as_str()) {
                return Err(Error::InvalidGraph(format!("duplicate node name '{}'", node.name)));
            }
        }

        let mut slots: HashSet<(NodeId, usize)> = HashSet::new();
        let mut in_count = vec![0usize; n];
        for edge in &edges {
            if edge.source.0 >= n || edge.sink.0 >= n {
                return Err(Error::InvalidGraph(format!("edge {edge:?} references a missing node")));
            }
            let source = &nodes[edge.source.0];
            if edge.source_port >= source.num_outputs() {
                return Err(Error::InvalidGraph(format!(
                    "node '{}' has no output port {}",
                    source.name, edge.source_port
                )));
            }
            if !slots.insert((edge.sink, edge.sink_index)) {
                return Err(Error::InvalidGraph(format!(
                    "input slot {} of node '{}' is fed twice",
                    edge.sink_index, nodes[edge.sink.0].name
                )));
            }
            in_count[edge.sink.0] += 1;
        }

        for (i, node) in nodes.iter().enumerate() {
            let (min, max) = node.op.arity();
            if in_count[i] < min || in_count[i] > max {
                return Err(Error::InvalidGraph(format!(
                    "{} node '{}' takes {} input(s), got {}",
                    node.op_type(),
                    node.name,
                    if min == max { min.to_string() } else { format!("at least {min}") },
                    in_count[i]
                )));
            }
            if (0..in_count[i]).any(|slot| !slots.contains(&(NodeId(i), slot))) {
                return Err(Error::InvalidGraph(format!(
                    "input slots of node '{}' are not contiguous",
                    node.name
                )));
            }
        }

        if outputs.is_empty() {
            return Err(Error::InvalidGraph("graph has no outputs".into()));
        }
        for out in &outputs {
            let valid = nodes
                .get(out.node.0)
                .is_some_and(|node| out.port < node.num_outputs());
            if !valid {
                return Err(Error::InvalidGraph(format!("output {out:?} does not exist")));
            }
        }

        let topo_order = kahn_order(n, &edges).ok_or_else(|| {
            Error::InvalidGraph("graph contains a cycle".into())
        })?;
        let inputs = topo_order
            .iter()
            .copied()
            .filter(|id| matches!(nodes[id.0].op, Op::Input { .. }))
            .collect();

        let graph = Self {
            stats: vec![None; n],
            nodes,
            edges,
            inputs,
            outputs,
            topo_order,
        };
        graph.validate_reuse_groups()?;
        Ok(graph)
    }

    fn validate_reuse_groups(&self) -> Result<()> {
        for node in &self.nodes {
            if node.reuse && node.reuse_group.is_none() {
                return Err(Error::InvalidGraph(format!(
                    "reused node '{}' has no reuse group",
                    node.name
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn find(&self, name: &str) -> Result<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(NodeId)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    /// Input nodes in topological order
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutTensor] {
        &self.outputs
    }

    pub fn topological_order(&self) -> &[NodeId] {
        &self.topo_order
    }

    /// Nodes in topological order
    pub fn topo_sorted_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.topo_order.iter().map(|&id| (id, &self.nodes[id.0]))
    }

    /// Incoming edges of `id`, ordered by input slot
    pub fn incoming_edges(&self, id: NodeId) -> Vec<&Edge> {
        let mut incoming: Vec<&Edge> = self.edges.iter().filter(|e| e.sink == id).collect();
        incoming.sort_by_key(|e| e.sink_index);
        incoming
    }

    pub fn outgoing_edges(&self, id: NodeId) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == id).collect()
    }

    /// Direct predecessors of `id`, ordered by input slot
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.incoming_edges(id).iter().map(|e| e.source).collect()
    }

    /// Resolve a node to the occurrence that owns its weights
    pub fn weight_owner(&self, id: NodeId) -> Result<NodeId> {
        let node = self.node(id);
        let Some(group) = node.reuse_group.as_deref() else {
            return Ok(id);
        };
        let owners: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.reuse_group.as_deref() == Some(group) && !n.reuse)
            .map(|(i, _)| NodeId(i))
            .collect();
        match owners.as_slice() {
            [owner] => Ok(*owner),
            _ => Err(Error::InvalidGraph(format!(
                "reuse group '{group}' of node '{}' has {} owning nodes, expected exactly one",
                node.name,
                owners.len()
            ))),
        }
    }

    pub fn get_out_stats_collector(&self, id: NodeId) -> Option<&StatsCollector> {
        self.stats.get(id.0).and_then(Option::as_ref)
    }

    pub fn out_stats_collector_mut(&mut self, id: NodeId) -> Option<&mut StatsCollector> {
        self.stats.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn set_out_stats_collector(&mut self, id: NodeId, collector: StatsCollector) {
        if let Some(slot) = self.stats.get_mut(id.0) {
            *slot = Some(collector);
        }
    }
}

/// Kahn's algorithm; `None` when the edges contain a cycle
fn kahn_order(n: usize, edges: &[Edge]) -> Option<Vec<NodeId>> {
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for edge in edges {
        adj[edge.source.0].push(edge.sink.0);
        in_degree[edge.sink.0] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> =
        (0..n).filter(|&i| in_degree[i] == 0).map(Reverse).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(Reverse(u)) = ready.pop() {
        order.push(NodeId(u));
        for &v in &adj[u] {
            in_degree[v] -= 1;
            if in_degree[v] == 0 {
                ready.push(Reverse(v));
            }
        }
    }

    (order.len() == n).then_some(order)
}
