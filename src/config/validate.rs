//! Configuration validation

use super::schema::{parse_tensor_ref, DatasetSpec, LayerSpec, RunSpec};
use crate::graph::Op;
use std::collections::HashSet;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Duplicate node name: {0}")]
    DuplicateName(String),

    #[error("Node '{node}' references unknown tensor '{reference}'")]
    UnresolvedReference { node: String, reference: String },

    #[error("Invalid tensor reference '{0}' (expected `name` or `name:port`)")]
    InvalidReference(String),

    #[error("Layer '{layer}' reuses unknown or later layer '{owner}'")]
    UnresolvedReuse { layer: String, owner: String },

    #[error("Layer '{0}' must have either an `op` or a `reuse`, not both")]
    AmbiguousLayer(String),

    #[error("Layer '{layer}' is malformed: {reason}")]
    InvalidLayer { layer: String, reason: String },

    #[error("Layer '{0}' needs a positive kernel size and strides")]
    InvalidWindow(String),

    #[error("Input '{0}' has an empty shape or a zero-sized axis")]
    InvalidInputShape(String),

    #[error("Model declares no {0}")]
    Empty(&'static str),

    #[error("Invalid batch size: {0} (must be > 0)")]
    InvalidBatchSize(usize),

    #[error("Invalid number of batches: {0} (must be > 0)")]
    InvalidNumBatches(usize),

    #[error("Invalid Hessian settings: {0}")]
    InvalidHessian(String),
}

/// Validate a run specification
///
/// Checks:
/// - Node names are unique
/// - Every tensor reference and reuse target names an earlier node
/// - Sizes, kernel sizes and strides are positive
/// - Hessian constants are consistent
pub fn validate_config(spec: &RunSpec) -> Result<(), ValidationError> {
    let model = &spec.model;
    if model.inputs.is_empty() {
        return Err(ValidationError::Empty("inputs"));
    }
    if model.outputs.is_empty() {
        return Err(ValidationError::Empty("outputs"));
    }

    let mut seen = HashSet::new();
    for input in &model.inputs {
        if !seen.insert(input.name.as_str()) {
            return Err(ValidationError::DuplicateName(input.name.clone()));
        }
        if input.shape.is_empty() || input.shape.contains(&0) {
            return Err(ValidationError::InvalidInputShape(input.name.clone()));
        }
    }

    let mut layers = HashSet::new();
    for layer in &model.layers {
        for reference in &layer.inputs {
            check_reference(&layer.name, reference, &seen)?;
        }
        match &layer.reuse {
            Some(_) if !layer.params.is_empty() => {
                return Err(ValidationError::AmbiguousLayer(layer.name.clone()));
            }
            Some(owner) if !layers.contains(owner.as_str()) => {
                return Err(ValidationError::UnresolvedReuse {
                    layer: layer.name.clone(),
                    owner: owner.clone(),
                });
            }
            Some(_) => {}
            None => check_window(layer)?,
        }
        if !seen.insert(layer.name.as_str()) {
            return Err(ValidationError::DuplicateName(layer.name.clone()));
        }
        layers.insert(layer.name.as_str());
    }

    for reference in &model.outputs {
        check_reference("outputs", reference, &seen)?;
    }

    let DatasetSpec::RandomNormal {
        batch_size,
        num_batches,
        ..
    } = &spec.dataset;
    if *batch_size == 0 {
        return Err(ValidationError::InvalidBatchSize(*batch_size));
    }
    if let Some(0) = num_batches {
        return Err(ValidationError::InvalidNumBatches(0));
    }

    spec.hessian
        .validate()
        .map_err(|e| ValidationError::InvalidHessian(e.to_string()))
}

fn check_window(layer: &LayerSpec) -> Result<(), ValidationError> {
    let op: Op = serde_yaml::from_value(serde_yaml::Value::Mapping(layer.params.clone()))
        .map_err(|e| ValidationError::InvalidLayer {
            layer: layer.name.clone(),
            reason: e.to_string(),
        })?;
    match op.window() {
        Some((kernel_size, strides)) if kernel_size.contains(&0) || strides.contains(&0) => {
            Err(ValidationError::InvalidWindow(layer.name.clone()))
        }
        _ => Ok(()),
    }
}

fn check_reference(
    node: &str,
    reference: &str,
    known: &HashSet<&str>,
) -> Result<(), ValidationError> {
    let (name, _) = parse_tensor_ref(reference)
        .ok_or_else(|| ValidationError::InvalidReference(reference.to_string()))?;
    if !known.contains(name) {
        return Err(ValidationError::UnresolvedReference {
            node: node.to_string(),
            reference: reference.to_string(),
        });
    }
    Ok(())
}
