//! Running statistics of a node's output tensor

use ndarray::ArrayD;

/// Running min / max / mean over every observed value
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsContainer {
    running_min: Option<f32>,
    running_max: Option<f32>,
    sum: f64,
    count: usize,
    num_batches: usize,
}

impl StatsContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch of values into the running statistics
    pub fn observe(&mut self, data: &[f32]) {
        if data.is_empty() {
            return;
        }

        let batch_min = data.iter().copied().fold(f32::INFINITY, f32::min);
        let batch_max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        self.running_min = Some(self.running_min.map_or(batch_min, |m| m.min(batch_min)));
        self.running_max = Some(self.running_max.map_or(batch_max, |m| m.max(batch_max)));

        self.sum += data.iter().map(|&v| f64::from(v)).sum::<f64>();
        self.count += data.len();
        self.num_batches += 1;
    }

    pub fn observe_array(&mut self, array: &ArrayD<f32>) {
        match array.as_slice() {
            Some(slice) => self.observe(slice),
            None => self.observe(&array.iter().copied().collect::<Vec<_>>()),
        }
    }

    pub fn min(&self) -> Option<f32> {
        self.running_min
    }

    pub fn max(&self) -> Option<f32> {
        self.running_max
    }

    pub fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / self.count as f64) as f32)
    }

    /// Number of values seen
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn has_data(&self) -> bool {
        self.num_batches > 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
