//! Evidential losses.
//!
//! - [`NigLoss`]: Normal-Inverse-Gamma loss for deep evidential regression
//!   (Amini et al., 2019).
//! - [`DecLoss`]: Dirichlet evidential classification loss (Sensoy et al.,
//!   2018) with mse, log and digamma fit terms and an annealed KL regulariser.

use crate::loss::{Loss, LossKind, LossOutput, Reduction};
use crate::utils::{ensure_same_shape, one_hot};
use crate::{TrainError, TrainResult};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::{digamma, ln_gamma};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Normal-Inverse-Gamma negative log-likelihood with evidence regularisation.
#[derive(Debug, Clone)]
pub struct NigLoss {
    reg_weight: f64,
    reduction: Reduction,
}

impl NigLoss {
    /// Create a new NIG loss.
    ///
    /// # Arguments
    /// * `reg_weight` - Weight of the evidence regulariser, non-negative
    /// * `reduction` - Reduction applied to the elementwise loss
    pub fn new(reg_weight: f64, reduction: Reduction) -> TrainResult<Self> {
        if reg_weight.is_nan() || reg_weight < 0.0 {
            return Err(TrainError::ConfigError(format!(
                "The regularization weight should be non-negative, but got {}.",
                reg_weight
            )));
        }
        Ok(Self {
            reg_weight,
            reduction,
        })
    }

    /// Get the regularisation weight.
    pub fn reg_weight(&self) -> f64 {
        self.reg_weight
    }

    /// Evaluates the loss on NIG parameters against targets.
    ///
    /// The five arrays are broadcast to a common `[N, D]` shape, so a
    /// per-sample column `[N, 1]` or a shared row `[1, D]` is accepted
    /// wherever a full matrix is.
    pub fn forward(
        &self,
        gamma: &ArrayView2<f64>,
        v: &ArrayView2<f64>,
        alpha: &ArrayView2<f64>,
        beta: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
    ) -> TrainResult<LossOutput> {
        let dims = [gamma.dim(), v.dim(), alpha.dim(), beta.dim(), targets.dim()];
        let shape = (
            dims.iter().map(|d| d.0).max().unwrap_or(0),
            dims.iter().map(|d| d.1).max().unwrap_or(0),
        );
        let gamma = broadcast_to("gamma", gamma, shape)?;
        let v = broadcast_to("v", v, shape)?;
        let alpha = broadcast_to("alpha", alpha, shape)?;
        let beta = broadcast_to("beta", beta, shape)?;
        let targets = broadcast_to("targets", targets, shape)?;

        let nll = Self::nll(&gamma, &v, &alpha, &beta, &targets);
        let reg = Self::regulariser(&gamma, &v, &alpha, &targets);
        let loss = nll + reg * self.reg_weight;
        Ok(self.reduction.apply(loss))
    }

    fn nll(
        gamma: &ArrayView2<f64>,
        v: &ArrayView2<f64>,
        alpha: &ArrayView2<f64>,
        beta: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
    ) -> Array2<f64> {
        let mut out = Array2::zeros(gamma.raw_dim());
        Zip::from(&mut out)
            .and(gamma)
            .and(v)
            .and(alpha)
            .and(beta)
            .and(targets)
            .for_each(|o, &g, &v, &a, &b, &y| {
                let big_gamma = 2.0 * b * (1.0 + v);
                *o = 0.5 * (std::f64::consts::PI / v).ln() - a * big_gamma.ln()
                    + (a + 0.5) * (big_gamma + v * (y - g).powi(2)).ln()
                    + ln_gamma(a)
                    - ln_gamma(a + 0.5);
            });
        out
    }

    /// `||y - gamma||_1` over the feature axis, scaled by total evidence `2v + alpha`.
    fn regulariser(
        gamma: &ArrayView2<f64>,
        v: &ArrayView2<f64>,
        alpha: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
    ) -> Array2<f64> {
        let error = (targets - gamma).mapv(f64::abs).sum_axis(Axis(1));
        let mut out = v * 2.0 + alpha;
        for (mut row, &err) in out.rows_mut().into_iter().zip(error.iter()) {
            row *= err;
        }
        out
    }
}

fn broadcast_to<'a>(
    what: &str,
    array: &'a ArrayView2<f64>,
    shape: (usize, usize),
) -> TrainResult<ArrayView2<'a, f64>> {
    array.broadcast(shape).ok_or_else(|| {
        TrainError::LossError(format!(
            "{} of shape {:?} cannot be broadcast to {:?}",
            what,
            array.dim(),
            shape
        ))
    })
}

/// Fit term of the evidential classification loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecLossType {
    /// Expected squared error plus predictive variance.
    Mse,
    /// Expected negative log-likelihood.
    #[default]
    Log,
    /// Bayes risk under digamma expectations.
    Digamma,
}

impl FromStr for DecLossType {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mse" => Ok(DecLossType::Mse),
            "log" => Ok(DecLossType::Log),
            "digamma" => Ok(DecLossType::Digamma),
            other => Err(TrainError::ConfigError(format!(
                "{} is not a valid value for mse/log/digamma loss.",
                other
            ))),
        }
    }
}

impl fmt::Display for DecLossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecLossType::Mse => "mse",
            DecLossType::Log => "log",
            DecLossType::Digamma => "digamma",
        };
        f.write_str(name)
    }
}

/// Deep evidential classification loss.
///
/// Evidence is clamped at zero and shifted into Dirichlet concentrations
/// `alpha = relu(evidence) + 1`. The KL regulariser pulls the concentration
/// of non-target classes toward the flat Dirichlet and is weighted by
/// [`DecLoss::annealing_coefficient`].
#[derive(Debug, Clone)]
pub struct DecLoss {
    annealing_step: Option<usize>,
    reg_weight: Option<f64>,
    loss_type: DecLossType,
    reduction: Reduction,
}

impl DecLoss {
    /// Create a new evidential classification loss.
    ///
    /// # Arguments
    /// * `annealing_step` - Epochs over which the regulariser ramps up to 1
    /// * `reg_weight` - Fixed regulariser weight, non-negative
    /// * `loss_type` - Fit term
    /// * `reduction` - Reduction of the per-sample loss `[N, 1]`
    pub fn new(
        annealing_step: Option<usize>,
        reg_weight: Option<f64>,
        loss_type: DecLossType,
        reduction: Reduction,
    ) -> TrainResult<Self> {
        if let Some(weight) = reg_weight {
            if weight.is_nan() || weight < 0.0 {
                return Err(TrainError::ConfigError(format!(
                    "The regularization weight should be non-negative, but got {}.",
                    weight
                )));
            }
        }
        if annealing_step == Some(0) {
            return Err(TrainError::ConfigError(
                "The annealing step should be positive, but got 0.".to_string(),
            ));
        }
        if let (Some(weight), Some(step)) = (reg_weight, annealing_step) {
            warn!(
                reg_weight = weight,
                annealing_step = step,
                "both reg_weight and annealing_step are set; reg_weight is ignored and the annealed coefficient is used"
            );
        }
        Ok(Self {
            annealing_step,
            reg_weight,
            loss_type,
            reduction,
        })
    }

    /// Get the fit term.
    pub fn loss_type(&self) -> DecLossType {
        self.loss_type
    }

    /// Get the reduction.
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Weight of the KL regulariser at `current_epoch`.
    ///
    /// | reg_weight | annealing_step | coefficient |
    /// |---|---|---|
    /// | none | none | 0 |
    /// | none | S | `min(1, epoch / S)` |
    /// | w | none | w |
    /// | w | S | `min(1, epoch / S)` |
    ///
    /// Fails with [`TrainError::MissingContext`] when an annealing step is
    /// configured and no epoch is given.
    pub fn annealing_coefficient(&self, current_epoch: Option<usize>) -> TrainResult<f64> {
        match (self.reg_weight, self.annealing_step) {
            (None, None) => Ok(0.0),
            (Some(weight), None) => Ok(weight),
            (_, Some(step)) => {
                let epoch = current_epoch.ok_or_else(|| {
                    TrainError::MissingContext(
                        "The epoch num should be positive when annealing_step is settled, but got None."
                            .to_string(),
                    )
                })?;
                Ok((epoch as f64 / step as f64).min(1.0))
            }
        }
    }

    /// Evaluates the loss on evidence `[N, C]` against class labels `[N]`.
    pub fn forward(
        &self,
        evidence: &ArrayView2<f64>,
        labels: &ArrayView1<usize>,
        current_epoch: Option<usize>,
    ) -> TrainResult<LossOutput> {
        if evidence.nrows() != labels.len() {
            return Err(TrainError::LossError(format!(
                "evidence has {} rows but {} labels were given",
                evidence.nrows(),
                labels.len()
            )));
        }
        let targets = one_hot(labels, evidence.ncols())?;
        self.forward_targets(evidence, &targets.view(), current_epoch)
    }

    /// Same as [`DecLoss::forward`] with one-hot (or soft) targets `[N, C]`.
    pub fn forward_targets(
        &self,
        evidence: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        current_epoch: Option<usize>,
    ) -> TrainResult<LossOutput> {
        ensure_same_shape("evidence vs targets", evidence.shape(), targets.shape())
            .map_err(|e| TrainError::LossError(e.to_string()))?;
        let coefficient = self.annealing_coefficient(current_epoch)?;

        let alpha = evidence.mapv(|e| e.max(0.0) + 1.0);
        let fit = match self.loss_type {
            DecLossType::Mse => mse_term(&alpha.view(), targets),
            DecLossType::Log => log_term(&alpha.view(), targets),
            DecLossType::Digamma => digamma_term(&alpha.view(), targets),
        };
        let reg = kl_regulariser(&alpha.view(), targets);

        Ok(self.reduction.apply(fit + reg * coefficient))
    }
}

fn strengths(alpha: &ArrayView2<f64>) -> ndarray::Array1<f64> {
    alpha.sum_axis(Axis(1))
}

fn mse_term(alpha: &ArrayView2<f64>, targets: &ArrayView2<f64>) -> Array2<f64> {
    let strength = strengths(alpha);
    let mut out = Array2::zeros((alpha.nrows(), 1));
    for (i, (a_row, t_row)) in alpha.rows().into_iter().zip(targets.rows()).enumerate() {
        let s = strength[i];
        let err: f64 = a_row
            .iter()
            .zip(t_row.iter())
            .map(|(&a, &t)| (t - a / s).powi(2))
            .sum();
        let var: f64 = a_row
            .iter()
            .map(|&a| a * (s - a) / (s * s * (s + 1.0)))
            .sum();
        out[[i, 0]] = err + var;
    }
    out
}

fn log_term(alpha: &ArrayView2<f64>, targets: &ArrayView2<f64>) -> Array2<f64> {
    expectation_term(alpha, targets, f64::ln)
}

fn digamma_term(alpha: &ArrayView2<f64>, targets: &ArrayView2<f64>) -> Array2<f64> {
    expectation_term(alpha, targets, digamma)
}

/// `sum_c t_c (f(S) - f(alpha_c))` per sample.
fn expectation_term(
    alpha: &ArrayView2<f64>,
    targets: &ArrayView2<f64>,
    f: fn(f64) -> f64,
) -> Array2<f64> {
    let strength = strengths(alpha);
    let mut out = Array2::zeros((alpha.nrows(), 1));
    for (i, (a_row, t_row)) in alpha.rows().into_iter().zip(targets.rows()).enumerate() {
        let fs = f(strength[i]);
        out[[i, 0]] = a_row
            .iter()
            .zip(t_row.iter())
            .map(|(&a, &t)| t * (fs - f(a)))
            .sum();
    }
    out
}

/// KL(Dir(alpha~) || Dir(1, ..., 1)) with `alpha~ = (alpha - 1)(1 - y) + 1`.
fn kl_regulariser(alpha: &ArrayView2<f64>, targets: &ArrayView2<f64>) -> Array2<f64> {
    let classes = alpha.ncols() as f64;
    let mut out = Array2::zeros((alpha.nrows(), 1));
    for (i, (a_row, t_row)) in alpha.rows().into_iter().zip(targets.rows()).enumerate() {
        let kl_alpha: Vec<f64> = a_row
            .iter()
            .zip(t_row.iter())
            .map(|(&a, &t)| (a - 1.0) * (1.0 - t) + 1.0)
            .collect();
        let sum: f64 = kl_alpha.iter().sum();
        // lgamma(1) == 0, so the flat-prior normaliser reduces to -lgamma(C)
        let first = ln_gamma(sum) - kl_alpha.iter().map(|&a| ln_gamma(a)).sum::<f64>()
            - ln_gamma(classes);
        let psi_sum = digamma(sum);
        let second: f64 = kl_alpha
            .iter()
            .map(|&a| (a - 1.0) * (digamma(a) - psi_sum))
            .sum();
        out[[i, 0]] = first + second;
    }
    out
}

impl Loss for DecLoss {
    /// Reduced loss without epoch context. `Reduction::None` falls back to the
    /// per-sample mean.
    fn compute(&self, evidence: &ArrayView2<f64>, targets: &ArrayView2<f64>) -> TrainResult<f64> {
        let output = self.forward_targets(evidence, targets, None)?;
        Ok(scalar_or_mean(&output))
    }

    fn compute_at_epoch(
        &self,
        evidence: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        current_epoch: usize,
    ) -> TrainResult<f64> {
        let output = self.forward_targets(evidence, targets, Some(current_epoch))?;
        Ok(scalar_or_mean(&output))
    }

    fn name(&self) -> &str {
        "dec"
    }

    fn kind(&self) -> LossKind {
        LossKind::Evidential
    }
}

fn scalar_or_mean(output: &LossOutput) -> f64 {
    match output {
        LossOutput::Scalar(v) => *v,
        LossOutput::Elementwise(values) => values.mean().unwrap_or(f64::NAN),
    }
}
