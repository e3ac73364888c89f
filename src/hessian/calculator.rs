//! Hutchinson estimator for the trace of the output Hessian
//!
//! For a random probe `v ~ N(0, I)` shaped like the concatenated model output,
//! `f = mean_batch(sum_features(v * out))` and `g = ∂f/∂target`. Squaring `g`
//! element-wise and averaging over probes estimates the diagonal of `JᵀJ`,
//! whose sum is the trace the sensitivity score is built from.

use super::cancel::CancellationToken;
use super::config::HessianConfig;
use super::request::{HessianInfoGranularity, HessianMode, TraceHessianRequest};
use crate::autograd::{backward, concat, reshape, Tensor};
use crate::backend::{Backend, GradTracking};
use crate::error::{Error, Result};
use crate::framework::FrameworkInfo;
use crate::graph::{Graph, Node};
use ndarray::{ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::{debug, trace};

/// Mix a 64-bit value (splitmix64 finalizer)
pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Flatten every output to `(batch, -1)` and concatenate along features
///
/// All outputs must agree on the batch axis.
pub fn concat_outputs(outputs: &[Tensor]) -> Result<Tensor> {
    let sizes: Vec<usize> = outputs
        .iter()
        .map(|o| o.shape().first().copied().unwrap_or(0))
        .collect();
    if sizes.is_empty() {
        return Err(Error::InvalidParameter("model has no outputs".into()));
    }
    if sizes.iter().any(|&s| s != sizes[0]) {
        return Err(Error::OutputBatchMismatch { sizes });
    }
    let flat = outputs
        .iter()
        .map(|o| reshape(o, &[sizes[0] as isize, -1]))
        .collect::<Result<Vec<_>>>()?;
    match flat.as_slice() {
        [single] => Ok(single.clone()),
        _ => concat(&flat, 1),
    }
}

/// Sum out every axis except `channel_axis` (per-channel), all axes (per-tensor), or none
pub fn reduce_to_granularity(
    squared: ArrayD<f32>,
    granularity: HessianInfoGranularity,
    channel_axis: usize,
) -> Result<ArrayD<f32>> {
    match granularity {
        HessianInfoGranularity::PerElement => Ok(squared),
        HessianInfoGranularity::PerTensor => Ok(ArrayD::from_elem(IxDyn(&[1]), squared.sum())),
        HessianInfoGranularity::PerOutputChannel => {
            if channel_axis >= squared.ndim() {
                return Err(Error::InvalidParameter(format!(
                    "channel axis {channel_axis} out of range for tensor of shape {:?}",
                    squared.shape()
                )));
            }
            let mut reduced = squared;
            // Descending, so lower axis indices stay valid
            for axis in (0..reduced.ndim()).rev() {
                if axis != channel_axis {
                    reduced = reduced.sum_axis(Axis(axis));
                }
            }
            Ok(reduced)
        }
    }
}

/// Produces one trace estimate per input batch for a single request
pub struct TraceHessianCalculator<'a> {
    graph: &'a Graph,
    backend: &'a dyn Backend,
    fw_info: &'a FrameworkInfo,
    request: TraceHessianRequest,
    config: HessianConfig,
    seed: u64,
    cancel: Option<CancellationToken>,
}

/// Where the gradient is read from and which axis holds channels
enum Target {
    Weight { attribute: String, channel_axis: usize },
    Activation { channel_axis: isize },
}

impl<'a> TraceHessianCalculator<'a> {
    /// Check the configuration and the request's eligibility
    pub fn new(
        graph: &'a Graph,
        backend: &'a dyn Backend,
        fw_info: &'a FrameworkInfo,
        request: TraceHessianRequest,
        config: HessianConfig,
    ) -> Result<Self> {
        config.validate()?;
        let seed = config.seed.unwrap_or(0);
        let calculator = Self {
            graph,
            backend,
            fw_info,
            request,
            config,
            seed,
            cancel: None,
        };
        calculator.target()?;
        Ok(calculator)
    }

    /// Seed of the probe vectors; iteration `j` uses `splitmix64(seed ^ j)`
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn request(&self) -> &TraceHessianRequest {
        &self.request
    }

    fn node(&self) -> Result<&'a Node> {
        let id = self.request.target_node();
        self.graph
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    fn unsupported(&self, node: &Node) -> Error {
        Error::UnsupportedOperator {
            node: node.name.clone(),
            op: node.op_type().to_string(),
            mode: self.request.mode().to_string(),
        }
    }

    fn target(&self) -> Result<Target> {
        let node = self.node()?;
        let op_type = node.op_type();
        match self.request.mode() {
            HessianMode::Weights => {
                if !self.fw_info.in_kernel_ops(node) {
                    return Err(self.unsupported(node));
                }
                let attribute = match self.fw_info.kernel_attributes(op_type) {
                    [single] => single.clone(),
                    other => {
                        return Err(Error::UnsupportedTopology {
                            node: node.name.clone(),
                            found: format!("{} weight attributes", other.len()),
                        })
                    }
                };
                let channels = self.fw_info.kernel_channels(op_type).ok_or_else(|| {
                    Error::ConfigError(format!("no kernel channels mapping for {op_type}"))
                })?;
                Ok(Target::Weight {
                    attribute,
                    channel_axis: channels.out_axis,
                })
            }
            HessianMode::Activation => {
                let eligible = self.fw_info.in_kernel_ops(node) || self.fw_info.in_activation_ops(node);
                if !eligible || self.fw_info.in_no_quantization_ops(node) {
                    return Err(self.unsupported(node));
                }
                if node.num_outputs() != 1 {
                    return Err(Error::UnsupportedTopology {
                        node: node.name.clone(),
                        found: format!("{} outputs", node.num_outputs()),
                    });
                }
                Ok(Target::Activation {
                    channel_axis: self.fw_info.activation_channel_axis(op_type),
                })
            }
        }
    }

    /// One trace estimate over `inputs`
    pub fn compute(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        self.compute_with_seed(inputs, self.seed)
    }

    /// [`compute`](Self::compute) with an explicit probe seed
    pub fn compute_with_seed(&self, inputs: &[ArrayD<f32>], seed: u64) -> Result<ArrayD<f32>> {
        let target = self.target()?;
        let tracking = match target {
            Target::Weight { .. } => GradTracking::Weights,
            Target::Activation { .. } => GradTracking::WeightsAndInputs,
        };

        // The pass (and its tape) lives until this function returns.
        let pass = self.backend.build_forward_pass(self.graph, inputs, tracking)?;
        let output = concat_outputs(pass.outputs())?;
        let batch = output.shape()[0].max(1) as f32;

        let id = self.request.target_node();
        let (target_tensor, channel_axis, batch_axis) = match &target {
            Target::Weight { attribute, channel_axis } => {
                (pass.parameter(id, attribute)?, *channel_axis, false)
            }
            Target::Activation { channel_axis } => {
                let tensor = pass.node_output(id, 0)?;
                let ndim = tensor.ndim() as isize;
                let axis = if *channel_axis < 0 { ndim + channel_axis } else { *channel_axis };
                if axis < 1 || axis >= ndim {
                    return Err(Error::InvalidParameter(format!(
                        "activation channel axis {channel_axis} invalid for tensor of rank {ndim}"
                    )));
                }
                // Scores are summed over the batch axis, which shifts channels down by one.
                (tensor, (axis - 1) as usize, true)
            }
        };

        let mut sum: Option<ArrayD<f32>> = None;
        let mut count = 0usize;

        for iteration in 0..self.config.num_iterations {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Cancelled);
            }

            let mut rng = StdRng::seed_from_u64(splitmix64(seed ^ iteration as u64));
            // ∂f/∂out for f = mean_batch(sum_features(v * out)) is v / batch
            let probe = ArrayD::from_shape_simple_fn(output.data().raw_dim(), || {
                rng.sample::<f32, _>(StandardNormal) / batch
            });
            backward(&output, Some(probe));

            let grad = target_tensor
                .grad()
                .unwrap_or_else(|| ArrayD::zeros(target_tensor.data().raw_dim()));
            let mut squared = grad.mapv(|g| g * g);
            if batch_axis {
                squared = squared.sum_axis(Axis(0));
            }
            let approx = reduce_to_granularity(squared, self.request.granularity(), channel_axis)?;

            if let Some(prev_sum) = sum.as_mut() {
                if iteration > self.config.min_iterations {
                    let old_mean = &*prev_sum / count as f32;
                    let new_mean = (&*prev_sum + &approx) / (count + 1) as f32;
                    let (eps, tol) = (self.config.epsilon, self.config.tolerance);
                    let converged = new_mean
                        .iter()
                        .zip(old_mean.iter())
                        .all(|(&new, &old)| (new - old).abs() / (new.abs() + eps) < tol);
                    if converged {
                        debug!(
                            node = %self.node()?.name,
                            iterations = count,
                            "trace estimate converged"
                        );
                        break;
                    }
                }
                *prev_sum += &approx;
            } else {
                sum = Some(approx);
            }
            count += 1;
            trace!(iteration, "trace approximation appended");
        }

        let total = sum.ok_or_else(|| {
            Error::InvalidParameter("trace estimation ran zero iterations".into())
        })?;
        Ok(total / count as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Dimension;
    use proptest::prelude::*;

    #[test]
    fn test_reduce_per_channel_keeps_channel_axis() {
        let squared = ArrayD::from_shape_fn(IxDyn(&[3, 3, 2, 4]), |idx| idx[3] as f32 + 1.0);
        let reduced =
            reduce_to_granularity(squared.clone(), HessianInfoGranularity::PerOutputChannel, 3)
                .unwrap();
        assert_eq!(reduced.shape(), &[4]);
        assert_eq!(reduced.as_slice().unwrap(), &[18.0, 36.0, 54.0, 72.0]);

        let reduced =
            reduce_to_granularity(squared.clone(), HessianInfoGranularity::PerOutputChannel, 0)
                .unwrap();
        assert_eq!(reduced.shape(), &[3]);

        let total = reduce_to_granularity(squared.clone(), HessianInfoGranularity::PerTensor, 3)
            .unwrap();
        assert_eq!(total.shape(), &[1]);
        assert_eq!(total[[0]], 180.0);

        let same = reduce_to_granularity(squared, HessianInfoGranularity::PerElement, 3).unwrap();
        assert_eq!(same.shape(), &[3, 3, 2, 4]);
    }

    #[test]
    fn test_reduce_rejects_bad_axis() {
        let squared = ArrayD::zeros(IxDyn(&[2, 2]));
        assert!(
            reduce_to_granularity(squared, HessianInfoGranularity::PerOutputChannel, 2).is_err()
        );
    }

    #[test]
    fn test_concat_outputs_flattens_and_checks_batch() {
        let a = Tensor::zeros(&[2, 3, 4], false);
        let b = Tensor::ones(&[2, 5], false);
        let joined = concat_outputs(&[a.clone(), b]).unwrap();
        assert_eq!(joined.shape(), &[2, 17]);

        let single = concat_outputs(&[a.clone()]).unwrap();
        assert_eq!(single.shape(), &[2, 12]);

        let c = Tensor::ones(&[3, 5], false);
        match concat_outputs(&[a, c]) {
            Err(Error::OutputBatchMismatch { sizes }) => assert_eq!(sizes, vec![2, 3]),
            other => panic!("expected batch mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_splitmix_spreads_neighbours() {
        assert_ne!(splitmix64(0), splitmix64(1));
        assert_ne!(splitmix64(1) >> 32, splitmix64(2) >> 32);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_per_channel_keeps_axis_and_total(
            shape in proptest::collection::vec(1usize..5, 1..5),
            axis_seed in 0usize..8,
        ) {
            let axis = axis_seed % shape.len();
            let squared = ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
                idx.slice().iter().sum::<usize>() as f32 * 0.5
            });
            let total = squared.sum();
            let reduced = reduce_to_granularity(
                squared,
                HessianInfoGranularity::PerOutputChannel,
                axis,
            )
            .unwrap();
            prop_assert_eq!(reduced.shape(), &[shape[axis]]);
            prop_assert!((reduced.sum() - total).abs() <= 1e-3 * total.max(1.0));
        }
    }
}
