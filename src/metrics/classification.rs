//! Accuracy, Brier score and negative log-likelihood.

use crate::utils::argmax;
use crate::{TrainError, TrainResult};
use ndarray::{ArrayView1, ArrayView2};

use super::{ensure_batch, ClassificationMetric, Metric};

/// Running `correct / total` counter.
#[derive(Debug, Clone, Default)]
struct Ratio {
    numerator: f64,
    count: usize,
}

impl Ratio {
    fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.numerator / self.count as f64
        }
    }
}

/// Top-1 accuracy of multiclass probabilities.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    state: Ratio,
}

impl Accuracy {
    /// Create a new accuracy metric.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for Accuracy {
    fn name(&self) -> &str {
        "acc"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.state.value())
    }

    fn reset(&mut self) {
        self.state = Ratio::default();
    }
}

impl ClassificationMetric for Accuracy {
    fn update(&mut self, probs: &ArrayView2<f64>, labels: &ArrayView1<usize>) -> TrainResult<()> {
        ensure_batch("accuracy", probs.nrows(), labels.len())?;
        for (row, &label) in probs.rows().into_iter().zip(labels.iter()) {
            if argmax(&row) == label {
                self.state.numerator += 1.0;
            }
        }
        self.state.count += labels.len();
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ClassificationMetric> {
        Box::new(self.clone())
    }
}

/// Accuracy of a binary `[N, 1]` positive-class probability column.
#[derive(Debug, Clone)]
pub struct BinaryAccuracy {
    /// Probabilities strictly above the threshold predict the positive class.
    pub threshold: f64,
    state: Ratio,
}

impl Default for BinaryAccuracy {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            state: Ratio::default(),
        }
    }
}

impl BinaryAccuracy {
    /// Create a binary accuracy metric with threshold 0.5.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for BinaryAccuracy {
    fn name(&self) -> &str {
        "acc"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.state.value())
    }

    fn reset(&mut self) {
        self.state = Ratio::default();
    }
}

impl ClassificationMetric for BinaryAccuracy {
    fn update(&mut self, probs: &ArrayView2<f64>, labels: &ArrayView1<usize>) -> TrainResult<()> {
        ensure_batch("binary accuracy", probs.nrows(), labels.len())?;
        if probs.ncols() != 1 {
            return Err(TrainError::MetricsError(format!(
                "binary accuracy expects a [N, 1] probability column, got {} columns",
                probs.ncols()
            )));
        }
        for (&p, &label) in probs.column(0).iter().zip(labels.iter()) {
            let predicted = usize::from(p > self.threshold);
            if predicted == label {
                self.state.numerator += 1.0;
            }
        }
        self.state.count += labels.len();
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ClassificationMetric> {
        Box::new(self.clone())
    }
}

/// Brier score: squared distance between the predicted distribution and the
/// one-hot target, summed over classes and averaged over samples.
///
/// A binary `[N, 1]` column is scored as `(p - y)^2`.
#[derive(Debug, Clone, Default)]
pub struct BrierScore {
    state: Ratio,
}

impl BrierScore {
    /// Create a new Brier score metric.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for BrierScore {
    fn name(&self) -> &str {
        "brier"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.state.value())
    }

    fn reset(&mut self) {
        self.state = Ratio::default();
    }
}

impl ClassificationMetric for BrierScore {
    fn update(&mut self, probs: &ArrayView2<f64>, labels: &ArrayView1<usize>) -> TrainResult<()> {
        ensure_batch("brier", probs.nrows(), labels.len())?;
        let binary = probs.ncols() == 1;
        for (row, &label) in probs.rows().into_iter().zip(labels.iter()) {
            self.state.numerator += if binary {
                (row[0] - label as f64).powi(2)
            } else {
                row.iter()
                    .enumerate()
                    .map(|(c, &p)| {
                        let target = if c == label { 1.0 } else { 0.0 };
                        (p - target).powi(2)
                    })
                    .sum::<f64>()
            };
        }
        self.state.count += labels.len();
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ClassificationMetric> {
        Box::new(self.clone())
    }
}

/// Mean negative log-probability of the true class.
#[derive(Debug, Clone, Default)]
pub struct NegativeLogLikelihood {
    state: Ratio,
}

impl NegativeLogLikelihood {
    /// Probabilities are clamped from below before taking the log.
    const EPS: f64 = 1e-12;

    /// Create a new NLL metric.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for NegativeLogLikelihood {
    fn name(&self) -> &str {
        "nll"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.state.value())
    }

    fn reset(&mut self) {
        self.state = Ratio::default();
    }
}

impl ClassificationMetric for NegativeLogLikelihood {
    fn update(&mut self, probs: &ArrayView2<f64>, labels: &ArrayView1<usize>) -> TrainResult<()> {
        ensure_batch("nll", probs.nrows(), labels.len())?;
        for (row, &label) in probs.rows().into_iter().zip(labels.iter()) {
            let p = row.get(label).copied().ok_or_else(|| {
                TrainError::MetricsError(format!(
                    "label {} out of range for {} classes",
                    label,
                    row.len()
                ))
            })?;
            self.state.numerator -= p.max(Self::EPS).ln();
        }
        self.state.count += labels.len();
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ClassificationMetric> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_accuracy() {
        let mut metric = Accuracy::new();
        let probs = array![[0.9, 0.1], [0.2, 0.8], [0.6, 0.4], [0.3, 0.7]];
        metric
            .update(&probs.view(), &array![0usize, 1, 1, 1].view())
            .unwrap();
        assert_abs_diff_eq!(metric.compute().unwrap(), 0.75, epsilon = 1e-12);

        metric.reset();
        assert_eq!(metric.compute().unwrap(), 0.0);
    }

    #[test]
    fn test_accuracy_shape_mismatch() {
        let mut metric = Accuracy::new();
        let probs = array![[0.9, 0.1], [0.2, 0.8]];
        assert!(metric.update(&probs.view(), &array![0usize].view()).is_err());
    }

    #[test]
    fn test_binary_accuracy_threshold() {
        let mut metric = BinaryAccuracy::new();
        let probs = array![[0.7], [0.5], [0.2]];
        metric
            .update(&probs.view(), &array![1usize, 1, 0].view())
            .unwrap();
        // 0.5 is not above the threshold and predicts the negative class
        assert_abs_diff_eq!(metric.compute().unwrap(), 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_brier_multiclass_and_binary() {
        let mut multi = BrierScore::new();
        multi
            .update(&array![[0.5, 0.5], [1.0, 0.0]].view(), &array![0usize, 0].view())
            .unwrap();
        assert_abs_diff_eq!(multi.compute().unwrap(), 0.25, epsilon = 1e-12);

        let mut binary = BrierScore::new();
        binary
            .update(&array![[0.8], [0.4]].view(), &array![1usize, 0].view())
            .unwrap();
        assert_abs_diff_eq!(
            binary.compute().unwrap(),
            (0.04 + 0.16) / 2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_negative_log_likelihood() {
        let mut metric = NegativeLogLikelihood::new();
        let probs = array![[0.25, 0.75], [0.5, 0.5]];
        metric
            .update(&probs.view(), &array![1usize, 0].view())
            .unwrap();
        let expected = -(0.75_f64.ln() + 0.5_f64.ln()) / 2.0;
        assert_abs_diff_eq!(metric.compute().unwrap(), expected, epsilon = 1e-12);

        assert!(metric
            .update(&probs.view(), &array![2usize, 0].view())
            .is_err());
    }
}
