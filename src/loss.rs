//! Loss functions for training.
//!
//! Provides the [`Loss`] trait, the standard classification criteria, the
//! reduction modes shared by the evidential losses, and the [`Criterion`]
//! handle a routine trains with.

use crate::bayesian::ElboLoss;
use crate::utils::{ensure_same_shape, log_softmax};
use crate::{TrainError, TrainResult};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::str::FromStr;

/// Tag describing what kind of criterion a loss is.
///
/// Routines branch on this tag instead of inspecting the loss object, so a
/// wrapped or decorated loss can declare the kind it behaves as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Softmax cross-entropy on logits.
    CrossEntropy,
    /// Sigmoid binary cross-entropy on logits; expects float targets.
    BinaryCrossEntropyWithLogits,
    /// Evidential (Dirichlet) loss on raw evidence.
    Evidential,
    /// Anything else.
    Other,
}

/// Trait for loss functions.
pub trait Loss: Debug + Send {
    /// Compute loss value.
    fn compute(&self, predictions: &ArrayView2<f64>, targets: &ArrayView2<f64>)
        -> TrainResult<f64>;

    /// Compute loss value knowing the current training epoch.
    ///
    /// Losses with epoch-dependent terms override this; the default ignores
    /// the epoch.
    fn compute_at_epoch(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        _current_epoch: usize,
    ) -> TrainResult<f64> {
        self.compute(predictions, targets)
    }

    /// Get the name of the loss function.
    fn name(&self) -> &str {
        "unknown"
    }

    /// Kind of criterion this loss behaves as.
    fn kind(&self) -> LossKind {
        LossKind::Other
    }
}

/// Reduction applied to elementwise loss values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Return the elementwise values.
    None,
    /// Average all values.
    #[default]
    Mean,
    /// Sum all values.
    Sum,
}

impl Reduction {
    /// Applies the reduction to an elementwise loss array.
    pub fn apply(self, values: Array2<f64>) -> LossOutput {
        match self {
            Reduction::None => LossOutput::Elementwise(values),
            Reduction::Mean => {
                let n = values.len();
                let mean = if n == 0 {
                    f64::NAN
                } else {
                    values.sum() / n as f64
                };
                LossOutput::Scalar(mean)
            }
            Reduction::Sum => LossOutput::Scalar(values.sum()),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Reduction::None => "none",
            Reduction::Mean => "mean",
            Reduction::Sum => "sum",
        }
    }
}

impl FromStr for Reduction {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Reduction::None),
            "mean" => Ok(Reduction::Mean),
            "sum" => Ok(Reduction::Sum),
            other => Err(TrainError::ConfigError(format!(
                "{} is not a valid value for reduction.",
                other
            ))),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a loss evaluated under a [`Reduction`].
#[derive(Debug, Clone, PartialEq)]
pub enum LossOutput {
    /// Reduced value (`mean` or `sum`).
    Scalar(f64),
    /// Unreduced values (`none`).
    Elementwise(Array2<f64>),
}

impl LossOutput {
    /// The reduced value, if any.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            LossOutput::Scalar(v) => Some(*v),
            LossOutput::Elementwise(_) => None,
        }
    }

    /// The unreduced values, if any.
    pub fn elementwise(&self) -> Option<&Array2<f64>> {
        match self {
            LossOutput::Scalar(_) => None,
            LossOutput::Elementwise(values) => Some(values),
        }
    }

    /// Sum of all values held.
    pub fn total(&self) -> f64 {
        match self {
            LossOutput::Scalar(v) => *v,
            LossOutput::Elementwise(values) => values.sum(),
        }
    }
}

/// Softmax cross-entropy computed from logits.
///
/// Targets are a `[N, C]` matrix of (possibly soft) class probabilities, so
/// mixed targets produced by mixup-style policies are accepted as is.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    /// Label smoothing factor in `[0, 1)`.
    pub label_smoothing: f64,
}

impl CrossEntropyLoss {
    /// Create a cross-entropy loss with label smoothing.
    pub fn with_label_smoothing(label_smoothing: f64) -> TrainResult<Self> {
        if !(0.0..1.0).contains(&label_smoothing) {
            return Err(TrainError::ConfigError(format!(
                "label smoothing must be in [0, 1), got {}",
                label_smoothing
            )));
        }
        Ok(Self { label_smoothing })
    }
}

impl Loss for CrossEntropyLoss {
    fn compute(
        &self,
        logits: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
    ) -> TrainResult<f64> {
        ensure_same_shape("cross-entropy logits vs targets", logits.shape(), targets.shape())
            .map_err(|e| TrainError::LossError(e.to_string()))?;
        let n = logits.nrows();
        if n == 0 {
            return Err(TrainError::LossError("empty batch".to_string()));
        }

        let classes = logits.ncols() as f64;
        let log_probs = log_softmax(logits);
        let smoothing = self.label_smoothing;
        let total: f64 = log_probs
            .iter()
            .zip(targets.iter())
            .map(|(&lp, &t)| -((1.0 - smoothing) * t + smoothing / classes) * lp)
            .sum();

        Ok(total / n as f64)
    }

    fn name(&self) -> &str {
        "cross_entropy"
    }

    fn kind(&self) -> LossKind {
        LossKind::CrossEntropy
    }
}

/// Binary cross-entropy with logits for numerical stability.
#[derive(Debug, Clone, Default)]
pub struct BCEWithLogitsLoss;

impl Loss for BCEWithLogitsLoss {
    fn compute(
        &self,
        logits: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
    ) -> TrainResult<f64> {
        ensure_same_shape("bce logits vs targets", logits.shape(), targets.shape())
            .map_err(|e| TrainError::LossError(e.to_string()))?;
        if logits.is_empty() {
            return Err(TrainError::LossError("empty batch".to_string()));
        }

        // max(x, 0) - x * z + log(1 + exp(-|x|))
        let total: f64 = logits
            .iter()
            .zip(targets.iter())
            .map(|(&x, &z)| x.max(0.0) - x * z + (-x.abs()).exp().ln_1p())
            .sum();

        Ok(total / logits.len() as f64)
    }

    fn name(&self) -> &str {
        "bce_with_logits"
    }

    fn kind(&self) -> LossKind {
        LossKind::BinaryCrossEntropyWithLogits
    }
}

/// The criterion a routine optimises.
///
/// Either a ready loss applied to the model's logits, or an ELBO loss that
/// drives its own stochastic forward passes through the model the routine
/// hands it at call time.
#[derive(Debug)]
pub enum Criterion {
    /// Loss applied to logits.
    Standard {
        /// Loss function.
        loss: Box<dyn Loss>,
        /// Kind the routine branches on.
        kind: LossKind,
    },
    /// Evidence lower bound for Bayesian networks.
    Elbo(ElboLoss),
}

impl Criterion {
    /// Wrap a loss, taking its kind from [`Loss::kind`].
    pub fn standard<L: Loss + 'static>(loss: L) -> Self {
        let kind = loss.kind();
        Criterion::Standard {
            loss: Box::new(loss),
            kind,
        }
    }

    /// Wrap a loss under an explicitly declared kind.
    pub fn with_kind(loss: Box<dyn Loss>, kind: LossKind) -> Self {
        Criterion::Standard { loss, kind }
    }

    /// Whether this criterion is an ELBO loss.
    pub fn is_elbo(&self) -> bool {
        matches!(self, Criterion::Elbo(_))
    }

    /// The declared loss kind (ELBO reports the kind of its inner criterion).
    pub fn kind(&self) -> LossKind {
        match self {
            Criterion::Standard { kind, .. } => *kind,
            Criterion::Elbo(elbo) => elbo.criterion().kind(),
        }
    }
}
