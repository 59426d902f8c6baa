//! Predictive uncertainty and ensemble diversity measures.
//!
//! Ensemble inputs are per-estimator probabilities laid out
//! `[batch, estimator, class]`. A trailing class axis of size 1 is read as
//! the positive-class probability of a binary problem and expanded to the
//! two-class distribution first.

use crate::utils::{argmax, as_distribution3, entr, mean_over_estimators, row_entropy};
use crate::{TrainError, TrainResult};
use ndarray::{Array1, ArrayView2, ArrayView3, Axis};

use super::{EnsembleMetric, Metric};

/// Running mean of per-sample values.
#[derive(Debug, Clone, Default)]
struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    fn extend(&mut self, values: &Array1<f64>) {
        self.sum += values.sum();
        self.count += values.len();
    }

    fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

fn check_estimators(metric: &str, probs: &ArrayView3<f64>) -> TrainResult<()> {
    if probs.len_of(Axis(1)) == 0 {
        return Err(TrainError::MetricsError(format!(
            "{}: no estimator in the ensemble axis",
            metric
        )));
    }
    Ok(())
}

/// Mean Shannon entropy of predicted distributions.
///
/// Single-model probabilities go through [`Entropy::update_probs`]; as an
/// [`EnsembleMetric`] it scores the entropy of the estimator-averaged
/// distribution.
#[derive(Debug, Clone, Default)]
pub struct Entropy {
    state: RunningMean,
}

impl Entropy {
    /// Create a new entropy metric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate the entropy of each row of `probs` (`[N, C]` or `[N, 1]`).
    pub fn update_probs(&mut self, probs: &ArrayView2<f64>) {
        self.state.extend(&row_entropy(probs));
    }
}

impl Metric for Entropy {
    fn name(&self) -> &str {
        "entropy"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.state.value())
    }

    fn reset(&mut self) {
        self.state = RunningMean::default();
    }
}

impl EnsembleMetric for Entropy {
    fn update(&mut self, probs: &ArrayView3<f64>) -> TrainResult<()> {
        check_estimators("entropy", probs)?;
        let mean = mean_over_estimators(probs)?;
        self.update_probs(&mean.view());
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn EnsembleMetric> {
        Box::new(self.clone())
    }
}

/// Mutual information between the prediction and the estimator:
/// entropy of the mean distribution minus the mean per-estimator entropy.
#[derive(Debug, Clone, Default)]
pub struct MutualInformation {
    state: RunningMean,
}

impl MutualInformation {
    /// Create a new mutual information metric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-sample mutual information of `[B, M, C]` probabilities.
    pub fn per_sample(probs: &ArrayView3<f64>) -> TrainResult<Array1<f64>> {
        check_estimators("mutual information", probs)?;
        let dist = as_distribution3(probs);
        let mean = mean_over_estimators(&dist.view())?;
        let total = row_entropy(&mean.view());
        let expected = dist.map_axis(Axis(2), |p| p.iter().map(|&v| entr(v)).sum::<f64>());
        let expected = expected.mean_axis(Axis(1)).ok_or_else(|| {
            TrainError::MetricsError("mutual information over zero estimators".to_string())
        })?;
        // clamp the tiny negative values left by rounding
        Ok((total - expected).mapv(|v| v.max(0.0)))
    }
}

impl Metric for MutualInformation {
    fn name(&self) -> &str {
        "mi"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.state.value())
    }

    fn reset(&mut self) {
        self.state = RunningMean::default();
    }
}

impl EnsembleMetric for MutualInformation {
    fn update(&mut self, probs: &ArrayView3<f64>) -> TrainResult<()> {
        self.state.extend(&Self::per_sample(probs)?);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn EnsembleMetric> {
        Box::new(self.clone())
    }
}

/// Fraction of estimator pairs whose top-class predictions differ.
///
/// Single-estimator ensembles have no pair and score 0.
#[derive(Debug, Clone, Default)]
pub struct Disagreement {
    state: RunningMean,
}

impl Disagreement {
    /// Create a new disagreement metric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-sample disagreement of `[B, M, C]` probabilities.
    pub fn per_sample(probs: &ArrayView3<f64>) -> TrainResult<Array1<f64>> {
        check_estimators("disagreement", probs)?;
        let dist = as_distribution3(probs);
        let (batch, estimators, classes) = dist.dim();
        if estimators < 2 {
            return Ok(Array1::zeros(batch));
        }
        let pairs = (estimators * (estimators - 1)) as f64 / 2.0;
        let mut out = Array1::zeros(batch);
        for (b, sample) in dist.outer_iter().enumerate() {
            let mut counts = vec![0usize; classes];
            for estimator in sample.rows() {
                counts[argmax(&estimator)] += 1;
            }
            let agreeing: f64 = counts
                .iter()
                .map(|&c| (c * c.saturating_sub(1)) as f64 / 2.0)
                .sum();
            out[b] = 1.0 - agreeing / pairs;
        }
        Ok(out)
    }
}

impl Metric for Disagreement {
    fn name(&self) -> &str {
        "disagreement"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.state.value())
    }

    fn reset(&mut self) {
        self.state = RunningMean::default();
    }
}

impl EnsembleMetric for Disagreement {
    fn update(&mut self, probs: &ArrayView3<f64>) -> TrainResult<()> {
        self.state.extend(&Self::per_sample(probs)?);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn EnsembleMetric> {
        Box::new(self.clone())
    }
}

/// Variation ratio: one minus the support of the ensemble's mode.
///
/// The non-probabilistic form counts estimators voting for the top class of
/// the averaged prediction; the probabilistic form averages the probability
/// each estimator gives that class.
#[derive(Debug, Clone, Default)]
pub struct VariationRatio {
    /// Use probabilities instead of votes.
    pub probabilistic: bool,
    state: RunningMean,
}

impl VariationRatio {
    /// Create a variation ratio metric.
    pub fn new(probabilistic: bool) -> Self {
        Self {
            probabilistic,
            state: RunningMean::default(),
        }
    }

    /// Per-sample variation ratio of estimator-first probabilities `[M, N, C]`.
    pub fn scores(&self, probs: &ArrayView3<f64>) -> TrainResult<Array1<f64>> {
        if probs.len_of(Axis(0)) == 0 {
            return Err(TrainError::MetricsError(
                "variation ratio: no estimator in the ensemble axis".to_string(),
            ));
        }
        let dist = as_distribution3(probs);
        let (estimators, batch, _) = dist.dim();
        let mean = dist.mean_axis(Axis(0)).ok_or_else(|| {
            TrainError::MetricsError("variation ratio over zero estimators".to_string())
        })?;

        let mut out = Array1::zeros(batch);
        for (n, averaged) in mean.outer_iter().enumerate() {
            let mode = argmax(&averaged);
            let support: f64 = (0..estimators)
                .map(|e| {
                    let estimator = dist.index_axis(Axis(0), e);
                    let row = estimator.row(n);
                    if self.probabilistic {
                        row[mode]
                    } else if argmax(&row) == mode {
                        1.0
                    } else {
                        0.0
                    }
                })
                .sum();
            out[n] = 1.0 - support / estimators as f64;
        }
        Ok(out)
    }
}

impl Metric for VariationRatio {
    fn name(&self) -> &str {
        "variation_ratio"
    }

    fn compute(&self) -> TrainResult<f64> {
        Ok(self.state.value())
    }

    fn reset(&mut self) {
        self.state = RunningMean::default();
    }
}

impl EnsembleMetric for VariationRatio {
    fn update(&mut self, probs: &ArrayView3<f64>) -> TrainResult<()> {
        let estimator_first = probs.view().permuted_axes([1, 0, 2]);
        let scores = self.scores(&estimator_first)?;
        self.state.extend(&scores);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn EnsembleMetric> {
        Box::new(self.clone())
    }
}
