//! Caching front end over the trace calculator
//!
//! Scores are stored per canonical request, in the order they were computed.
//! Asking for `n` scores returns the first `n` stored ones and computes only
//! the shortfall, drawing one batch from the representative dataset per new
//! score. Concurrent callers for the same canonical request are serialized on
//! that request's slot, so no score is computed twice; distinct requests run
//! in parallel. Slots live as long as the service, so clearing the cache
//! empties them in place and never detaches a computation in flight.

use super::calculator::{splitmix64, TraceHessianCalculator};
use super::cancel::CancellationToken;
use super::config::HessianConfig;
use super::dataset::{Batch, RepresentativeDataset};
use super::request::{HessianInfoGranularity, HessianMode, TraceHessianRequest};
use crate::backend::{Backend, TapeBackend};
use crate::error::{Error, Result};
use crate::framework::{default_framework_info, FrameworkInfo};
use crate::graph::{Graph, NodeId};
use ndarray::ArrayD;
use rand::Rng;
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Scores of one canonical request
///
/// `scores` stays locked for the whole computation; `len` mirrors its length
/// so introspection never waits on a computation.
#[derive(Default)]
struct Slot {
    scores: Mutex<Vec<ArrayD<f32>>>,
    len: AtomicUsize,
}

impl Slot {
    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn publish(&self, scores: &[ArrayD<f32>]) {
        self.len.store(scores.len(), Ordering::Release);
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HessianInfoService {
    graph: Arc<Graph>,
    fw_info: Arc<FrameworkInfo>,
    backend: Arc<dyn Backend>,
    config: HessianConfig,
    seed: u64,
    dataset: Mutex<Box<dyn RepresentativeDataset>>,
    cache: Mutex<HashMap<TraceHessianRequest, Arc<Slot>>>,
    cancel: CancellationToken,
}

impl HessianInfoService {
    /// Service over `graph` with the default framework info, tape backend and config
    pub fn new(graph: Arc<Graph>, dataset: impl RepresentativeDataset + 'static) -> Self {
        let config = HessianConfig::default();
        let seed = resolve_seed(&config);
        Self {
            graph,
            fw_info: Arc::new(default_framework_info().clone()),
            backend: Arc::new(TapeBackend),
            config,
            seed,
            dataset: Mutex::new(Box::new(dataset)),
            cache: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_framework_info(mut self, fw_info: Arc<FrameworkInfo>) -> Self {
        self.fw_info = fw_info;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the estimator configuration; the seed is re-resolved from it
    pub fn with_config(mut self, config: HessianConfig) -> Result<Self> {
        config.validate()?;
        self.seed = resolve_seed(&config);
        self.config = config;
        Ok(self)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn framework_info(&self) -> &FrameworkInfo {
        &self.fw_info
    }

    pub fn config(&self) -> &HessianConfig {
        &self.config
    }

    /// Token that aborts in-flight computations at the next iteration
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request under which scores for `request` are cached
    ///
    /// Weight requests against a reused occurrence map to the weight owner,
    /// so every occurrence shares one score list.
    pub fn canonical_request(&self, request: &TraceHessianRequest) -> Result<TraceHessianRequest> {
        let target = request.target_node();
        if self.graph.get(target).is_none() {
            return Err(Error::NodeNotFound(target.to_string()));
        }
        match request.mode() {
            HessianMode::Weights => Ok(request.retarget(self.graph.weight_owner(target)?)),
            HessianMode::Activation => Ok(*request),
        }
    }

    /// Nodes that accept requests in `mode`, in topological order
    pub fn eligible_nodes(&self, mode: HessianMode) -> Vec<NodeId> {
        self.graph
            .topological_order()
            .iter()
            .copied()
            .filter(|&id| {
                let request = TraceHessianRequest::new(mode, HessianInfoGranularity::PerTensor, id);
                TraceHessianCalculator::new(
                    &self.graph,
                    self.backend.as_ref(),
                    &self.fw_info,
                    request,
                    self.config.clone(),
                )
                .is_ok()
            })
            .collect()
    }

    /// First `required_size` scores for `request`, computing any that are missing
    pub fn fetch_hessian(
        &self,
        request: &TraceHessianRequest,
        required_size: usize,
    ) -> Result<Vec<ArrayD<f32>>> {
        if required_size == 0 {
            return Ok(Vec::new());
        }
        let canonical = self.canonical_request(request)?;
        let slot = Arc::clone(lock(&self.cache).entry(canonical).or_default());

        let mut scores = lock(&slot.scores);
        if scores.len() < required_size {
            self.compute_missing(&canonical, &slot, &mut scores, required_size)?;
        }
        Ok(scores[..required_size].to_vec())
    }

    /// [`fetch_hessian`](Self::fetch_hessian) for several requests in parallel
    ///
    /// Results follow the order of `requests`.
    pub fn fetch_hessian_many(
        &self,
        requests: &[TraceHessianRequest],
        required_size: usize,
    ) -> Result<Vec<Vec<ArrayD<f32>>>> {
        requests
            .par_iter()
            .map(|request| self.fetch_hessian(request, required_size))
            .collect()
    }

    fn compute_missing(
        &self,
        canonical: &TraceHessianRequest,
        slot: &Slot,
        scores: &mut Vec<ArrayD<f32>>,
        required_size: usize,
    ) -> Result<()> {
        let shortfall = required_size - scores.len();
        let calculator = TraceHessianCalculator::new(
            &self.graph,
            self.backend.as_ref(),
            &self.fw_info,
            *canonical,
            self.config.clone(),
        )?
        .with_cancellation(self.cancel.clone());

        if let Some(remaining) = lock(&self.dataset).remaining() {
            if remaining < shortfall {
                return Err(Error::DataExhausted {
                    requested: shortfall,
                    produced: remaining,
                });
            }
        }

        info!(
            node = %self.graph.node(canonical.target_node()).name,
            mode = %canonical.mode(),
            granularity = %canonical.granularity(),
            cached = scores.len(),
            missing = shortfall,
            "computing Hessian trace scores"
        );

        for produced in 0..shortfall {
            let batch = self.next_batch().ok_or(Error::DataExhausted {
                requested: shortfall,
                produced,
            })?;
            let index = scores.len();
            let score = calculator.compute_with_seed(&batch, self.sample_seed(canonical, index))?;
            debug!(index, shape = ?score.shape(), "score cached");
            scores.push(score);
            slot.publish(scores);
        }
        Ok(())
    }

    fn next_batch(&self) -> Option<Batch> {
        lock(&self.dataset).next_batch()
    }

    /// Seed of score `index` for `request`
    fn sample_seed(&self, request: &TraceHessianRequest, index: usize) -> u64 {
        let mut hasher = DefaultHasher::new();
        request.hash(&mut hasher);
        splitmix64(self.seed ^ hasher.finish() ^ splitmix64(index as u64))
    }

    /// Number of scores cached for `request` (after canonicalization)
    ///
    /// Scores of a computation still in flight are counted as they land.
    pub fn count_saved_info_of_request(&self, request: &TraceHessianRequest) -> Result<usize> {
        let canonical = self.canonical_request(request)?;
        Ok(lock(&self.cache).get(&canonical).map_or(0, |slot| slot.len()))
    }

    /// Number of canonical requests holding at least one score
    pub fn num_cached_requests(&self) -> usize {
        lock(&self.cache).values().filter(|slot| slot.len() > 0).count()
    }

    /// Drop every cached score
    ///
    /// Waits for computations in flight, then empties their slots.
    pub fn clear_saved_hessian_info(&self) {
        let slots: Vec<Arc<Slot>> = lock(&self.cache).values().cloned().collect();
        for slot in slots {
            let mut scores = lock(&slot.scores);
            scores.clear();
            slot.publish(&scores);
        }
        info!("Hessian score cache cleared");
    }
}

fn resolve_seed(config: &HessianConfig) -> u64 {
    config.seed.unwrap_or_else(|| rand::rng().random())
}
