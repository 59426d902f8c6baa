//! Batches, batch iteration and batch formatting.

use crate::{TrainError, TrainResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Configuration for batch processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Batch size.
    pub batch_size: usize,
    /// Whether to shuffle data.
    pub shuffle: bool,
    /// Whether to drop last incomplete batch.
    pub drop_last: bool,
    /// Random seed for shuffling.
    pub seed: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            drop_last: false,
            seed: None,
        }
    }
}

impl BatchConfig {
    /// Sequential batches of `batch_size` (evaluation order).
    pub fn sequential(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: None,
        }
    }
}

/// A classification batch: inputs `[N, F]` and labels `[N]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Inputs.
    pub inputs: Array2<f64>,
    /// Class labels.
    pub targets: Array1<usize>,
}

impl Batch {
    /// Create a batch, checking that inputs and targets hold the same number
    /// of samples.
    pub fn new(inputs: Array2<f64>, targets: Array1<usize>) -> TrainResult<Self> {
        if inputs.nrows() != targets.len() {
            return Err(TrainError::BatchError(format!(
                "inputs have {} rows but targets have {} entries",
                inputs.nrows(),
                targets.len()
            )));
        }
        Ok(Self { inputs, targets })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Iterator over batches of sample indices.
#[derive(Debug)]
pub struct BatchIterator {
    /// Configuration.
    config: BatchConfig,
    /// Current batch index.
    current_batch: usize,
    /// Sample order for the epoch.
    indices: Vec<usize>,
    /// Shuffling source.
    rng: StdRng,
}

impl BatchIterator {
    /// Create a new batch iterator.
    pub fn new(num_samples: usize, config: BatchConfig) -> TrainResult<Self> {
        if config.batch_size == 0 {
            return Err(TrainError::InvalidParameter(
                "batch_size must be positive".to_string(),
            ));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut iterator = Self {
            config,
            current_batch: 0,
            indices: (0..num_samples).collect(),
            rng,
        };
        iterator.reset();
        Ok(iterator)
    }

    /// Get the next batch indices.
    pub fn next_batch(&mut self) -> Option<Vec<usize>> {
        let start = self.current_batch * self.config.batch_size;
        if start >= self.indices.len() {
            return None;
        }
        let end = (start + self.config.batch_size).min(self.indices.len());
        if self.config.drop_last && end - start < self.config.batch_size {
            return None;
        }
        self.current_batch += 1;
        Some(self.indices[start..end].to_vec())
    }

    /// Rewind for a new epoch, reshuffling if configured.
    pub fn reset(&mut self) {
        self.current_batch = 0;
        if self.config.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        let n = self.indices.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }
}

impl Iterator for BatchIterator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

/// Extract a batch from data arrays.
pub fn extract_batch(
    inputs: &ArrayView2<f64>,
    targets: &ArrayView1<usize>,
    indices: &[usize],
) -> TrainResult<Batch> {
    if let Some(&bad) = indices.iter().find(|&&i| i >= inputs.nrows()) {
        return Err(TrainError::BatchError(format!(
            "index {} out of range for {} samples",
            bad,
            inputs.nrows()
        )));
    }
    Batch::new(inputs.select(Axis(0), indices), targets.select(Axis(0), indices))
}

/// Final transformation of a training batch before the forward pass.
///
/// Receives mixed inputs and encoded targets.
pub trait BatchFormatter: Debug + Send {
    /// Format a batch.
    fn format(
        &self,
        inputs: Array2<f64>,
        targets: Array2<f64>,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)>;
}

/// Leaves the batch untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFormatter;

impl BatchFormatter for IdentityFormatter {
    fn format(
        &self,
        inputs: Array2<f64>,
        targets: Array2<f64>,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        Ok((inputs, targets))
    }
}

/// Stacks the targets `num_repeats` times, matching the `[M * N, C]` output
/// of an ensemble trained with a plain loss.
#[derive(Debug, Clone, Copy)]
pub struct RepeatTarget {
    /// Number of copies.
    pub num_repeats: usize,
}

impl RepeatTarget {
    /// Create a new repeat formatter.
    pub fn new(num_repeats: usize) -> TrainResult<Self> {
        if num_repeats == 0 {
            return Err(TrainError::InvalidParameter(
                "num_repeats must be at least 1".to_string(),
            ));
        }
        Ok(Self { num_repeats })
    }
}

impl BatchFormatter for RepeatTarget {
    fn format(
        &self,
        inputs: Array2<f64>,
        targets: Array2<f64>,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        let views = vec![targets.view(); self.num_repeats];
        let repeated = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| TrainError::BatchError(e.to_string()))?;
        Ok((inputs, repeated))
    }
}
