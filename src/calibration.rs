//! Post-hoc temperature scaling.
//!
//! [`TemperatureScaler::fit`] learns one scalar temperature on a held-out
//! calibration set; [`CalibratedModel`] borrows a model and divides its logits
//! by that temperature.
//!
//! Reference: Guo et al. "On Calibration of Modern Neural Networks" (ICML 2017)

use crate::data::Dataset;
use crate::model::{BayesianModule, Model};
use crate::utils::log_softmax;
use crate::{TrainError, TrainResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use tracing::{debug, info};

/// Learns a scalar logit temperature by minimising the mean NLL.
#[derive(Debug, Clone)]
pub struct TemperatureScaler {
    temperature: f64,
    /// Search interval for the temperature.
    bounds: (f64, f64),
    /// Stop when the log-temperature interval is narrower than this.
    tolerance: f64,
    max_iters: usize,
}

impl Default for TemperatureScaler {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            bounds: (0.05, 20.0),
            tolerance: 1e-6,
            max_iters: 200,
        }
    }
}

impl TemperatureScaler {
    /// Create an unfitted scaler (temperature 1).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the temperature search interval.
    pub fn with_bounds(mut self, low: f64, high: f64) -> TrainResult<Self> {
        if !(low > 0.0 && high > low) {
            return Err(TrainError::InvalidParameter(format!(
                "temperature bounds must satisfy 0 < low < high, got ({}, {})",
                low, high
            )));
        }
        self.bounds = (low, high);
        Ok(self)
    }

    /// Scaler with a fixed temperature.
    pub fn with_temperature(temperature: f64) -> TrainResult<Self> {
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Err(TrainError::InvalidParameter(format!(
                "temperature must be positive, got {}",
                temperature
            )));
        }
        Ok(Self {
            temperature,
            ..Self::default()
        })
    }

    /// Learned temperature.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Fit the temperature on `calibration_set` using `model`'s logits.
    ///
    /// Ensemble models stacking `k` estimators as `[k * N, C]` are scored
    /// against the labels repeated `k` times.
    pub fn fit<M: Model + ?Sized>(
        &mut self,
        model: &mut M,
        calibration_set: &Dataset,
        binary: bool,
    ) -> TrainResult<f64> {
        if calibration_set.is_empty() {
            return Err(TrainError::CalibrationError(
                "calibration set is empty".to_string(),
            ));
        }
        let logits = model.forward(&calibration_set.inputs.view())?;
        let labels = &calibration_set.targets;
        let n = labels.len();
        if logits.nrows() % n != 0 {
            return Err(TrainError::CalibrationError(format!(
                "{} logit rows cannot be matched with {} labels",
                logits.nrows(),
                n
            )));
        }
        let repeats = logits.nrows() / n;
        let labels: Array1<usize> = labels.iter().cycle().take(n * repeats).copied().collect();
        self.fit_logits(&logits.view(), &labels.view(), binary)
    }

    /// Fit the temperature on precomputed logits.
    pub fn fit_logits(
        &mut self,
        logits: &ArrayView2<f64>,
        labels: &ArrayView1<usize>,
        binary: bool,
    ) -> TrainResult<f64> {
        if logits.nrows() != labels.len() || logits.nrows() == 0 {
            return Err(TrainError::CalibrationError(format!(
                "cannot calibrate {} logit rows against {} labels",
                logits.nrows(),
                labels.len()
            )));
        }
        if binary && logits.ncols() != 1 {
            return Err(TrainError::CalibrationError(format!(
                "binary calibration expects [N, 1] logits, got {} columns",
                logits.ncols()
            )));
        }

        let objective = |log_t: f64| nll(logits, labels, log_t.exp(), binary);
        let before = objective(0.0)?;

        // golden-section search on log T; the NLL is convex in 1 / T
        let inv_phi = (5.0_f64.sqrt() - 1.0) / 2.0;
        let (mut a, mut b) = (self.bounds.0.ln(), self.bounds.1.ln());
        let mut c = b - inv_phi * (b - a);
        let mut d = a + inv_phi * (b - a);
        let mut fc = objective(c)?;
        let mut fd = objective(d)?;
        for _ in 0..self.max_iters {
            if (b - a).abs() < self.tolerance {
                break;
            }
            if fc < fd {
                b = d;
                d = c;
                fd = fc;
                c = b - inv_phi * (b - a);
                fc = objective(c)?;
            } else {
                a = c;
                c = d;
                fc = fd;
                d = a + inv_phi * (b - a);
                fd = objective(d)?;
            }
        }
        let log_t = (a + b) / 2.0;
        let after = objective(log_t)?;
        // keep T = 1 when scaling does not help
        self.temperature = if after <= before { log_t.exp() } else { 1.0 };

        info!(
            temperature = self.temperature,
            nll_before = before,
            nll_after = after.min(before),
            "fitted temperature scaler"
        );
        Ok(self.temperature)
    }

    /// Divide logits by the temperature.
    pub fn scale(&self, logits: &ArrayView2<f64>) -> Array2<f64> {
        logits.mapv(|z| z / self.temperature)
    }

    /// Wrap `model` so its logits are temperature-scaled.
    pub fn calibrate<'a, M: Model + ?Sized>(&self, model: &'a mut M) -> CalibratedModel<'a, M> {
        CalibratedModel {
            model,
            temperature: self.temperature,
        }
    }
}

/// Mean NLL of `logits / temperature`.
fn nll(
    logits: &ArrayView2<f64>,
    labels: &ArrayView1<usize>,
    temperature: f64,
    binary: bool,
) -> TrainResult<f64> {
    let scaled = logits.mapv(|z| z / temperature);
    let n = labels.len() as f64;
    let total = if binary {
        // -log sigmoid(z) for positives, -log sigmoid(-z) for negatives
        scaled
            .column(0)
            .iter()
            .zip(labels.iter())
            .map(|(&z, &y)| {
                let signed = if y == 1 { z } else { -z };
                (-signed).max(0.0) + (-signed.abs()).exp().ln_1p()
            })
            .sum::<f64>()
    } else {
        let log_probs = log_softmax(&scaled.view());
        let mut total = 0.0;
        for (row, &label) in log_probs.rows().into_iter().zip(labels.iter()) {
            let lp = row.get(label).copied().ok_or_else(|| {
                TrainError::CalibrationError(format!(
                    "label {} out of range for {} classes",
                    label,
                    row.len()
                ))
            })?;
            total -= lp;
        }
        total
    };
    debug!(temperature, nll = total / n, "temperature objective");
    Ok(total / n)
}

/// A borrowed model whose logits are divided by a learned temperature.
#[derive(Debug)]
pub struct CalibratedModel<'a, M: ?Sized> {
    model: &'a mut M,
    temperature: f64,
}

impl<M: ?Sized> CalibratedModel<'_, M> {
    /// Temperature applied to the logits.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }
}

impl<M: Model + ?Sized> Model for CalibratedModel<'_, M> {
    fn forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        let temperature = self.temperature;
        Ok(self.model.forward(input)?.mapv(|z| z / temperature))
    }

    fn feats_forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        self.model.feats_forward(input)
    }

    fn has_feature_extractor(&self) -> bool {
        self.model.has_feature_extractor()
    }

    fn bayesian_modules(&self) -> Vec<&dyn BayesianModule> {
        self.model.bayesian_modules()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearModel;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Logits that are 3x too confident for labels drawn at p = 0.75.
    fn overconfident() -> (Array2<f64>, Array1<usize>) {
        let z = 3.0 * 3.0_f64.ln();
        let logits = array![[z, 0.0], [z, 0.0], [z, 0.0], [z, 0.0]];
        (logits, array![0usize, 0, 0, 1])
    }

    #[test]
    fn test_fit_recovers_temperature() {
        let (logits, labels) = overconfident();
        let mut scaler = TemperatureScaler::new();
        let t = scaler
            .fit_logits(&logits.view(), &labels.view(), false)
            .unwrap();
        // softmax(z / 3) gives exactly 0.75
        assert_abs_diff_eq!(t, 3.0, epsilon = 1e-3);
        let scaled = scaler.scale(&logits.view());
        assert_abs_diff_eq!(scaled[[0, 0]], 3.0_f64.ln(), epsilon = 1e-3);
    }

    #[test]
    fn test_fit_binary() {
        let z = 2.0 * 3.0_f64.ln();
        let logits = array![[z], [z], [z], [z]];
        let labels = array![1usize, 1, 1, 0];
        let mut scaler = TemperatureScaler::new();
        let t = scaler
            .fit_logits(&logits.view(), &labels.view(), true)
            .unwrap();
        assert_abs_diff_eq!(t, 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_scaling_never_hurts() {
        let logits = array![[1.0, 0.0], [0.0, 1.0]];
        let labels = array![0usize, 1];
        let mut scaler = TemperatureScaler::new();
        scaler
            .fit_logits(&logits.view(), &labels.view(), false)
            .unwrap();
        let before = nll(&logits.view(), &labels.view(), 1.0, false).unwrap();
        let after = nll(&logits.view(), &labels.view(), scaler.temperature(), false).unwrap();
        assert!(after <= before);
    }

    #[test]
    fn test_fit_through_model_and_wrapper() {
        let mut model =
            LinearModel::from_parameters(array![[3.0 * 3.0_f64.ln(), 0.0]], array![0.0, 0.0])
                .unwrap();
        let (_, labels) = overconfident();
        let set = Dataset::new(Array2::ones((4, 1)), labels).unwrap();
        let mut scaler = TemperatureScaler::new();
        scaler.fit(&mut model, &set, false).unwrap();

        let mut calibrated = scaler.calibrate(&mut model);
        assert_abs_diff_eq!(calibrated.temperature(), 3.0, epsilon = 1e-3);
        let out = calibrated.forward(&array![[1.0]].view()).unwrap();
        assert_abs_diff_eq!(out[[0, 0]], 3.0_f64.ln(), epsilon = 1e-3);
    }

    #[test]
    fn test_invalid_inputs() {
        let mut scaler = TemperatureScaler::new();
        let logits = array![[0.0, 1.0]];
        assert!(scaler
            .fit_logits(&logits.view(), &array![0usize, 1].view(), false)
            .is_err());
        assert!(scaler
            .fit_logits(&logits.view(), &array![0usize].view(), true)
            .is_err());
        assert!(TemperatureScaler::with_temperature(0.0).is_err());
        assert!(TemperatureScaler::new().with_bounds(2.0, 1.0).is_err());
    }
}
