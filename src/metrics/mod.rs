//! Stateful metric accumulators and the pools a routine groups them into.
//!
//! Every accumulator follows the same lifecycle: `update` once per batch,
//! then `compute` and `reset` at the epoch boundary, in that order. The
//! `update` signature depends on the metric family:
//!
//! - [`ClassificationMetric`]: probabilities `[N, C]` (or a binary `[N, 1]`
//!   column) against class labels.
//! - [`OodMetric`]: one OOD score per sample against binary labels
//!   (1 = out-of-distribution).
//! - [`EnsembleMetric`]: per-estimator probabilities `[B, M, C]`.

use crate::{TrainError, TrainResult};
use ndarray::{ArrayView1, ArrayView2, ArrayView3};
use std::collections::BTreeMap;
use std::fmt::Debug;

mod calibration;
mod classification;
mod ood;
mod uncertainty;

pub use calibration::{BinaryCalibrationError, CalibrationError};
pub use classification::{Accuracy, BinaryAccuracy, BrierScore, NegativeLogLikelihood};
pub use ood::{Auroc, AveragePrecision, Fpr95};
pub use uncertainty::{Disagreement, Entropy, MutualInformation, VariationRatio};

/// Values produced by a metric pool, keyed by prefixed metric name.
pub type MetricValues = BTreeMap<String, f64>;

/// Trait for accumulating metrics.
pub trait Metric: Debug + Send {
    /// Get metric name.
    fn name(&self) -> &str;

    /// Compute the metric over everything accumulated since the last reset.
    fn compute(&self) -> TrainResult<f64>;

    /// Reset metric state.
    fn reset(&mut self);
}

/// Metrics fed with predicted probabilities and class labels.
pub trait ClassificationMetric: Metric {
    /// Accumulate one batch.
    fn update(&mut self, probs: &ArrayView2<f64>, labels: &ArrayView1<usize>) -> TrainResult<()>;

    /// Clone into a box.
    fn clone_box(&self) -> Box<dyn ClassificationMetric>;
}

/// Metrics fed with OOD scores (higher means more likely OOD).
pub trait OodMetric: Metric {
    /// Accumulate one batch; `labels` holds 0 for in-distribution, 1 for OOD.
    fn update(&mut self, scores: &ArrayView1<f64>, labels: &ArrayView1<usize>) -> TrainResult<()>;

    /// Clone into a box.
    fn clone_box(&self) -> Box<dyn OodMetric>;
}

/// Metrics fed with per-estimator probabilities `[B, M, C]`.
pub trait EnsembleMetric: Metric {
    /// Accumulate one batch.
    fn update(&mut self, probs: &ArrayView3<f64>) -> TrainResult<()>;

    /// Clone into a box.
    fn clone_box(&self) -> Box<dyn EnsembleMetric>;
}

impl Clone for Box<dyn ClassificationMetric> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl Clone for Box<dyn OodMetric> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl Clone for Box<dyn EnsembleMetric> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A named group of accumulators sharing a key prefix.
#[derive(Debug, Clone)]
pub struct MetricCollection<M: ?Sized> {
    prefix: String,
    metrics: Vec<Box<M>>,
}

impl<M: Metric + ?Sized> MetricCollection<M> {
    /// Create a collection whose keys are `prefix + metric name`.
    pub fn new(prefix: impl Into<String>, metrics: Vec<Box<M>>) -> Self {
        Self {
            prefix: prefix.into(),
            metrics,
        }
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether the collection holds no metric.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Prefixed keys, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.metrics
            .iter()
            .map(|m| format!("{}{}", self.prefix, m.name()))
            .collect()
    }

    /// Compute every metric.
    pub fn compute(&self) -> TrainResult<MetricValues> {
        let mut values = MetricValues::new();
        for metric in &self.metrics {
            values.insert(format!("{}{}", self.prefix, metric.name()), metric.compute()?);
        }
        Ok(values)
    }

    /// Reset every metric.
    pub fn reset(&mut self) {
        for metric in &mut self.metrics {
            metric.reset();
        }
    }

    /// Compute every metric, then reset.
    pub fn compute_and_reset(&mut self) -> TrainResult<MetricValues> {
        let values = self.compute()?;
        self.reset();
        Ok(values)
    }
}

impl<M: Metric + ?Sized> MetricCollection<M>
where
    Box<M>: Clone,
{
    /// Copy of this collection under another prefix.
    pub fn clone_with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            metrics: self.metrics.clone(),
        }
    }
}

impl MetricCollection<dyn ClassificationMetric> {
    /// Update every metric with one batch.
    pub fn update(&mut self, probs: &ArrayView2<f64>, labels: &ArrayView1<usize>) -> TrainResult<()> {
        for metric in &mut self.metrics {
            metric.update(probs, labels)?;
        }
        Ok(())
    }
}

impl MetricCollection<dyn OodMetric> {
    /// Update every metric with one batch.
    pub fn update(&mut self, scores: &ArrayView1<f64>, labels: &ArrayView1<usize>) -> TrainResult<()> {
        for metric in &mut self.metrics {
            metric.update(scores, labels)?;
        }
        Ok(())
    }
}

impl MetricCollection<dyn EnsembleMetric> {
    /// Update every metric with one batch.
    pub fn update(&mut self, probs: &ArrayView3<f64>) -> TrainResult<()> {
        for metric in &mut self.metrics {
            metric.update(probs)?;
        }
        Ok(())
    }
}

/// Checks that a prediction batch and its labels have the same length.
pub(crate) fn ensure_batch(metric: &str, rows: usize, labels: usize) -> TrainResult<()> {
    if rows != labels {
        return Err(TrainError::MetricsError(format!(
            "{}: {} predictions vs {} targets",
            metric, rows, labels
        )));
    }
    Ok(())
}

/// Classification pool for a routine: binary metrics when `num_classes == 1`,
/// the multiclass set (with NLL) otherwise.
pub fn classification_collection(
    prefix: &str,
    num_classes: usize,
) -> MetricCollection<dyn ClassificationMetric> {
    let metrics: Vec<Box<dyn ClassificationMetric>> = if num_classes == 1 {
        vec![
            Box::new(BinaryAccuracy::new()),
            Box::new(BinaryCalibrationError::default()),
            Box::new(BrierScore::new()),
        ]
    } else {
        vec![
            Box::new(Accuracy::new()),
            Box::new(CalibrationError::default()),
            Box::new(BrierScore::new()),
            Box::new(NegativeLogLikelihood::new()),
        ]
    };
    MetricCollection::new(prefix, metrics)
}

/// OOD detection pool: FPR at 95% TPR, AUROC and AUPR.
pub fn ood_collection(prefix: &str) -> MetricCollection<dyn OodMetric> {
    MetricCollection::new(
        prefix,
        vec![
            Box::new(Fpr95::new()) as Box<dyn OodMetric>,
            Box::new(Auroc::new()),
            Box::new(AveragePrecision::new()),
        ],
    )
}

/// Ensemble agreement pool: disagreement, mutual information and entropy of
/// the averaged prediction.
pub fn ensemble_collection(prefix: &str) -> MetricCollection<dyn EnsembleMetric> {
    MetricCollection::new(
        prefix,
        vec![
            Box::new(Disagreement::new()) as Box<dyn EnsembleMetric>,
            Box::new(MutualInformation::new()),
            Box::new(Entropy::new()),
        ],
    )
}
