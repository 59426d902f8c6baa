//! OOD detection metrics over accumulated scores.
//!
//! Scores are "higher means more likely OOD"; OOD samples are the positive
//! class (label 1).

use crate::{TrainError, TrainResult};
use ndarray::ArrayView1;
use std::cmp::Ordering;
use tracing::warn;

use super::{ensure_batch, Metric, OodMetric};

/// Scores and labels accumulated since the last reset.
#[derive(Debug, Clone, Default)]
struct ScoreBuffer {
    scores: Vec<f64>,
    labels: Vec<bool>,
}

/// Cumulative counts at each distinct threshold, highest threshold first.
struct BinaryCurve {
    false_positives: Vec<f64>,
    true_positives: Vec<f64>,
    positives: f64,
    negatives: f64,
}

impl ScoreBuffer {
    fn extend(
        &mut self,
        metric: &str,
        scores: &ArrayView1<f64>,
        labels: &ArrayView1<usize>,
    ) -> TrainResult<()> {
        ensure_batch(metric, scores.len(), labels.len())?;
        for (&score, &label) in scores.iter().zip(labels.iter()) {
            if label > 1 {
                return Err(TrainError::MetricsError(format!(
                    "{}: OOD labels must be 0 or 1, got {}",
                    metric, label
                )));
            }
            self.scores.push(score);
            self.labels.push(label == 1);
        }
        Ok(())
    }

    /// Builds the curve, or `None` (with a warning) when one class is absent.
    fn curve(&self, metric: &str) -> Option<BinaryCurve> {
        let positives = self.labels.iter().filter(|&&l| l).count() as f64;
        let negatives = self.labels.len() as f64 - positives;
        if positives == 0.0 || negatives == 0.0 {
            warn!(
                metric,
                positives, negatives, "OOD metric needs both classes; returning 0"
            );
            return None;
        }

        let mut order: Vec<usize> = (0..self.scores.len()).collect();
        order.sort_by(|&a, &b| {
            self.scores[b]
                .partial_cmp(&self.scores[a])
                .unwrap_or(Ordering::Equal)
        });

        let mut false_positives = Vec::new();
        let mut true_positives = Vec::new();
        let (mut fp, mut tp) = (0.0, 0.0);
        for (rank, &idx) in order.iter().enumerate() {
            if self.labels[idx] {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
            let last_of_threshold = order
                .get(rank + 1)
                .map_or(true, |&next| self.scores[next] != self.scores[idx]);
            if last_of_threshold {
                false_positives.push(fp);
                true_positives.push(tp);
            }
        }

        Some(BinaryCurve {
            false_positives,
            true_positives,
            positives,
            negatives,
        })
    }

    fn clear(&mut self) {
        self.scores.clear();
        self.labels.clear();
    }
}

macro_rules! ood_metric_boilerplate {
    ($ty:ident, $name:literal) => {
        impl OodMetric for $ty {
            fn update(
                &mut self,
                scores: &ArrayView1<f64>,
                labels: &ArrayView1<usize>,
            ) -> TrainResult<()> {
                self.buffer.extend($name, scores, labels)
            }

            fn clone_box(&self) -> Box<dyn OodMetric> {
                Box::new(self.clone())
            }
        }

        impl $ty {
            /// Create an empty metric.
            pub fn new() -> Self {
                Self::default()
            }
        }
    };
}

/// False positive rate at the first threshold reaching 95% true positive rate.
#[derive(Debug, Clone, Default)]
pub struct Fpr95 {
    buffer: ScoreBuffer,
}

ood_metric_boilerplate!(Fpr95, "fpr95");

impl Metric for Fpr95 {
    fn name(&self) -> &str {
        "fpr95"
    }

    fn compute(&self) -> TrainResult<f64> {
        const RECALL_LEVEL: f64 = 0.95;
        let Some(curve) = self.buffer.curve("fpr95") else {
            return Ok(0.0);
        };
        let fpr = curve
            .true_positives
            .iter()
            .zip(curve.false_positives.iter())
            .find(|&(&tp, _)| tp / curve.positives >= RECALL_LEVEL)
            .map_or(1.0, |(_, &fp)| fp / curve.negatives);
        Ok(fpr)
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Area under the ROC curve, trapezoidal, tied scores sharing one point.
#[derive(Debug, Clone, Default)]
pub struct Auroc {
    buffer: ScoreBuffer,
}

ood_metric_boilerplate!(Auroc, "auroc");

impl Metric for Auroc {
    fn name(&self) -> &str {
        "auroc"
    }

    fn compute(&self) -> TrainResult<f64> {
        let Some(curve) = self.buffer.curve("auroc") else {
            return Ok(0.0);
        };
        let (mut area, mut prev_fpr, mut prev_tpr) = (0.0, 0.0, 0.0);
        for (&fp, &tp) in curve.false_positives.iter().zip(curve.true_positives.iter()) {
            let fpr = fp / curve.negatives;
            let tpr = tp / curve.positives;
            area += (fpr - prev_fpr) * (tpr + prev_tpr) / 2.0;
            prev_fpr = fpr;
            prev_tpr = tpr;
        }
        Ok(area)
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Average precision (area under the precision-recall curve), reported as
/// `aupr`: `sum_n (R_n - R_{n-1}) P_n` over distinct thresholds.
#[derive(Debug, Clone, Default)]
pub struct AveragePrecision {
    buffer: ScoreBuffer,
}

ood_metric_boilerplate!(AveragePrecision, "aupr");

impl Metric for AveragePrecision {
    fn name(&self) -> &str {
        "aupr"
    }

    fn compute(&self) -> TrainResult<f64> {
        let Some(curve) = self.buffer.curve("aupr") else {
            return Ok(0.0);
        };
        let (mut ap, mut prev_recall) = (0.0, 0.0);
        for (&fp, &tp) in curve.false_positives.iter().zip(curve.true_positives.iter()) {
            let recall = tp / curve.positives;
            let precision = tp / (tp + fp);
            ap += (recall - prev_recall) * precision;
            prev_recall = recall;
        }
        Ok(ap)
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}
