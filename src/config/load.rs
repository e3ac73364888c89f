//! Loading a run file and turning it into a graph and a dataset

use super::schema::{parse_tensor_ref, DatasetSpec, ModelSpec, RunSpec};
use super::validate::validate_config;
use crate::error::{Error, Result};
use crate::graph::{Graph, GraphBuilder, NodeId, Op, OutTensor};
use crate::hessian::RandomNormalDataset;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Read, parse and validate a YAML run file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RunSpec> {
    let path = path.as_ref();
    let yaml = fs::read_to_string(path).map_err(|e| {
        Error::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
    })?;
    parse_config(&yaml)
}

/// Parse and validate YAML text
pub fn parse_config(yaml: &str) -> Result<RunSpec> {
    let spec: RunSpec = serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {e}")))?;
    validate_config(&spec).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;
    Ok(spec)
}

/// Build the float model described by `model`
pub fn build_graph(model: &ModelSpec) -> Result<Graph> {
    let mut builder = GraphBuilder::new(model.seed);
    let mut ids: HashMap<&str, NodeId> = HashMap::new();

    let resolve = |ids: &HashMap<&str, NodeId>, reference: &str| -> Result<OutTensor> {
        let (name, port) = parse_tensor_ref(reference)
            .ok_or_else(|| Error::ConfigError(format!("invalid tensor reference '{reference}'")))?;
        let id = ids
            .get(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        Ok(id.out(port))
    };

    for input in &model.inputs {
        ids.insert(&input.name, builder.input(&input.name, &input.shape)?);
    }

    for layer in &model.layers {
        let inputs = layer
            .inputs
            .iter()
            .map(|r| resolve(&ids, r))
            .collect::<Result<Vec<_>>>()?;
        let id = match &layer.reuse {
            Some(owner) => builder.reuse(&layer.name, owner, &inputs)?,
            None => {
                let op: Op = serde_yaml::from_value(serde_yaml::Value::Mapping(layer.params.clone()))
                    .map_err(|e| Error::ConfigError(format!("layer '{}': {e}", layer.name)))?;
                builder.layer(&layer.name, op, &inputs)?
            }
        };
        debug!(layer = %layer.name, "layer added");
        ids.insert(&layer.name, id);
    }

    for reference in &model.outputs {
        builder.output(resolve(&ids, reference)?);
    }
    builder.build()
}

/// Representative dataset for `spec`, shaped like `graph`'s inputs
pub fn build_dataset(spec: &RunSpec, graph: &Graph) -> Result<RandomNormalDataset> {
    let DatasetSpec::RandomNormal {
        batch_size,
        num_batches,
        seed,
    } = &spec.dataset;

    let shapes = graph
        .inputs()
        .iter()
        .map(|&id| match &graph.node(id).op {
            Op::Input { shape } => {
                let mut full = vec![*batch_size];
                full.extend(shape);
                Ok(full)
            }
            _ => Err(Error::InvalidGraph(format!("{id} is not an input"))),
        })
        .collect::<Result<Vec<_>>>()?;

    let dataset = RandomNormalDataset::new(shapes, seed.unwrap_or(spec.model.seed))?;
    Ok(match num_batches {
        Some(n) => dataset.with_limit(*n),
        None => dataset,
    })
}
