//! Calibration metrics.

use crate::utils::{argmax, confidence};
use crate::{TrainError, TrainResult};
use ndarray::{ArrayView1, ArrayView2};

use super::{ensure_batch, ClassificationMetric, Metric};

/// Default number of confidence bins.
const DEFAULT_NUM_BINS: usize = 15;

/// Per-bin running sums shared by the calibration metrics.
///
/// Bin `i` covers `[i / n, (i + 1) / n)`; a confidence of exactly 1 lands in
/// an extra last bin.
#[derive(Debug, Clone)]
struct ConfidenceBins {
    counts: Vec<usize>,
    confidences: Vec<f64>,
    accuracies: Vec<f64>,
    total: usize,
}

impl ConfidenceBins {
    fn new(num_bins: usize) -> Self {
        Self {
            counts: vec![0; num_bins + 1],
            confidences: vec![0.0; num_bins + 1],
            accuracies: vec![0.0; num_bins + 1],
            total: 0,
        }
    }

    fn num_bins(&self) -> usize {
        self.counts.len() - 1
    }

    fn add(&mut self, confidence: f64, accuracy: f64) {
        let num_bins = self.num_bins();
        let idx = ((confidence * num_bins as f64).floor().max(0.0) as usize).min(num_bins);
        self.counts[idx] += 1;
        self.confidences[idx] += confidence;
        self.accuracies[idx] += accuracy;
        self.total += 1;
    }

    /// L1 expected calibration error.
    fn l1_error(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let mut ece = 0.0;
        for i in 0..self.counts.len() {
            if self.counts[i] > 0 {
                let count = self.counts[i] as f64;
                let gap = self.accuracies[i] / count - self.confidences[i] / count;
                ece += gap.abs() * count / self.total as f64;
            }
        }
        ece
    }

    fn reset(&mut self) {
        *self = Self::new(self.num_bins());
    }
}

fn validate_bins(num_bins: usize) -> TrainResult<()> {
    if num_bins == 0 {
        return Err(TrainError::InvalidParameter(
            "num_bins must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Expected calibration error of multiclass predictions.
///
/// Each sample contributes its top-class probability as confidence and
/// whether the top class is correct as accuracy.
///
/// Reference: Guo et al. "On Calibration of Modern Neural Networks" (ICML 2017)
#[derive(Debug, Clone)]
pub struct CalibrationError {
    bins: ConfidenceBins,
}

impl Default for CalibrationError {
    fn default() -> Self {
        Self {
            bins: ConfidenceBins::new(DEFAULT_NUM_BINS),
        }
    }
}

impl CalibrationError {
    /// Create with custom number of bins.
    pub fn new(num_bins: usize) -> TrainResult<Self> {
        validate_bins(num_bins)?;
        Ok(Self {
            bins: ConfidenceBins::new(num_bins),
        })
    }
}

impl Metric for CalibrationError {
    fn name(&self) -> &str {
        "ece"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.bins.l1_error())
    }

    fn reset(&mut self) {
        self.bins.reset();
    }
}

impl ClassificationMetric for CalibrationError {
    fn update(&mut self, probs: &ArrayView2<f64>, labels: &ArrayView1<usize>) -> TrainResult<()> {
        ensure_batch("ece", probs.nrows(), labels.len())?;
        let conf = confidence(probs);
        for ((row, &label), &c) in probs.rows().into_iter().zip(labels.iter()).zip(conf.iter()) {
            let correct = if argmax(&row) == label { 1.0 } else { 0.0 };
            self.bins.add(c, correct);
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ClassificationMetric> {
        Box::new(self.clone())
    }
}

/// Expected calibration error of binary predictions.
///
/// Takes a `[N, 1]` positive-class probability column; the confidence is the
/// probability itself and the accuracy is the label.
#[derive(Debug, Clone)]
pub struct BinaryCalibrationError {
    bins: ConfidenceBins,
}

impl Default for BinaryCalibrationError {
    fn default() -> Self {
        Self {
            bins: ConfidenceBins::new(DEFAULT_NUM_BINS),
        }
    }
}

impl BinaryCalibrationError {
    /// Create with custom number of bins.
    pub fn new(num_bins: usize) -> TrainResult<Self> {
        validate_bins(num_bins)?;
        Ok(Self {
            bins: ConfidenceBins::new(num_bins),
        })
    }
}

impl Metric for BinaryCalibrationError {
    fn name(&self) -> &str {
        "ece"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.bins.l1_error())
    }

    fn reset(&mut self) {
        self.bins.reset();
    }
}

impl ClassificationMetric for BinaryCalibrationError {
    fn update(&mut self, probs: &ArrayView2<f64>, labels: &ArrayView1<usize>) -> TrainResult<()> {
        ensure_batch("binary ece", probs.nrows(), labels.len())?;
        if probs.ncols() != 1 {
            return Err(TrainError::MetricsError(format!(
                "binary ece expects a [N, 1] probability column, got {} columns",
                probs.ncols()
            )));
        }
        for (&p, &label) in probs.column(0).iter().zip(labels.iter()) {
            self.bins.add(p, if label == 1 { 1.0 } else { 0.0 });
        }
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
    fn test_calibration_error_poor() {
        let mut metric = CalibrationError::default();

        // High confidence but wrong predictions
        let probs = array![[0.9, 0.1], [0.9, 0.1], [0.9, 0.1], [0.9, 0.1]];
        metric
            .update(&probs.view(), &array![1usize, 1, 1, 1].view())
            .unwrap();

        assert_abs_diff_eq!(metric.compute().unwrap(), 0.9, epsilon = 1e-12);
    }

    #[test]
    fn test_calibration_error_two_bins() {
        let mut metric = CalibrationError::default();
        // confidences 0.95 (bin 14, correct) and 0.6 (bin 9, wrong)
        let probs = array![[0.95, 0.05], [0.4, 0.6]];
        metric
            .update(&probs.view(), &array![0usize, 0].view())
            .unwrap();
        let expected = 0.5 * (1.0 - 0.95) + 0.5 * 0.6;
        assert_abs_diff_eq!(metric.compute().unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_calibration_error_accumulates_across_batches() {
        let mut split = CalibrationError::default();
        let mut joint = CalibrationError::default();
        let a = array![[0.7, 0.3], [0.2, 0.8]];
        let b = array![[0.55, 0.45]];
        split.update(&a.view(), &array![0usize, 0].view()).unwrap();
        split.update(&b.view(), &array![1usize].view()).unwrap();
        let all = array![[0.7, 0.3], [0.2, 0.8], [0.55, 0.45]];
        joint
            .update(&all.view(), &array![0usize, 0, 1].view())
            .unwrap();
        assert_abs_diff_eq!(
            split.compute().unwrap(),
            joint.compute().unwrap(),
            epsilon = 1e-12
        );

        split.reset();
        assert_eq!(split.compute().unwrap(), 0.0);
    }

    #[test]
    fn test_binary_calibration_error() {
        let mut metric = BinaryCalibrationError::default();
        let probs = array![[0.8], [0.8], [0.1]];
        metric
            .update(&probs.view(), &array![1usize, 0, 0].view())
            .unwrap();
        // bin of 0.8: conf 0.8, acc 0.5; bin of 0.1: conf 0.1, acc 0
        let expected = (2.0 / 3.0) * 0.3 + (1.0 / 3.0) * 0.1;
        assert_abs_diff_eq!(metric.compute().unwrap(), expected, epsilon = 1e-12);

        assert!(metric
            .update(&array![[0.2, 0.8]].view(), &array![1usize].view())
            .is_err());
    }

    #[test]
    fn test_confidence_of_one_is_binned() {
        let mut metric = CalibrationError::new(10).unwrap();
        metric
            .update(&array![[1.0, 0.0]].view(), &array![0usize].view())
            .unwrap();
        assert_abs_diff_eq!(metric.compute().unwrap(), 0.0, epsilon = 1e-12);
        assert!(CalibrationError::new(0).is_err());
    }
}
