//! Representative data sources
//!
//! A source hands out batches lazily, one `Vec` entry per model input. Restart
//! policy belongs to the source; the service only reports exhaustion.

use crate::error::{Error, Result};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::VecDeque;

/// One input tensor per model input, batch axis first
pub type Batch = Vec<ArrayD<f32>>;

pub trait RepresentativeDataset: Send {
    /// Next batch, or `None` once the source is exhausted
    fn next_batch(&mut self) -> Option<Batch>;

    /// Batches still available, when the source knows
    fn remaining(&self) -> Option<usize> {
        None
    }
}

/// Pre-materialized batches, handed out once each
#[derive(Debug, Default)]
pub struct FiniteDataset {
    batches: VecDeque<Batch>,
}

impl FiniteDataset {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

impl RepresentativeDataset for FiniteDataset {
    fn next_batch(&mut self) -> Option<Batch> {
        self.batches.pop_front()
    }

    fn remaining(&self) -> Option<usize> {
        Some(self.batches.len())
    }
}

/// Batches produced by a closure; returning `None` ends the stream
pub struct GeneratorDataset<F> {
    generator: F,
}

impl<F> GeneratorDataset<F>
where
    F: FnMut() -> Option<Batch> + Send,
{
    pub fn new(generator: F) -> Self {
        Self { generator }
    }
}

impl<F> RepresentativeDataset for GeneratorDataset<F>
where
    F: FnMut() -> Option<Batch> + Send,
{
    fn next_batch(&mut self) -> Option<Batch> {
        (self.generator)()
    }
}

/// Seeded standard-normal batches for fixed input shapes
#[derive(Debug)]
pub struct RandomNormalDataset {
    shapes: Vec<Vec<usize>>,
    rng: StdRng,
    limit: Option<usize>,
    produced: usize,
}

impl RandomNormalDataset {
    /// `shapes` are full input shapes including the batch axis
    pub fn new(shapes: Vec<Vec<usize>>, seed: u64) -> Result<Self> {
        if shapes.is_empty() {
            return Err(Error::InvalidParameter(
                "random dataset needs at least one input shape".into(),
            ));
        }
        if let Some(bad) = shapes.iter().find(|s| s.is_empty() || s.contains(&0)) {
            return Err(Error::InvalidParameter(format!(
                "random dataset input shape {bad:?} must be non-empty with positive sizes"
            )));
        }
        Ok(Self {
            shapes,
            rng: StdRng::seed_from_u64(seed),
            limit: None,
            produced: 0,
        })
    }

    /// Stop after `num_batches` batches
    pub fn with_limit(mut self, num_batches: usize) -> Self {
        self.limit = Some(num_batches);
        self
    }
}

impl RepresentativeDataset for RandomNormalDataset {
    fn next_batch(&mut self) -> Option<Batch> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return None;
        }
        self.produced += 1;
        let rng = &mut self.rng;
        Some(
            self.shapes
                .iter()
                .map(|shape| ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.sample(StandardNormal)))
                .collect(),
        )
    }

    fn remaining(&self) -> Option<usize> {
        self.limit.map(|limit| limit.saturating_sub(self.produced))
    }
}
