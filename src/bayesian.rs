//! Variational losses for Bayesian neural networks.
//!
//! The KL aggregator borrows the model on every call instead of keeping a
//! handle to it, so a routine can own both the model and the loss.

use crate::loss::Loss;
use crate::model::Model;
use crate::{TrainError, TrainResult};
use ndarray::ArrayView2;
use tracing::debug;

/// Sums `log q(w) - log p(w)` over the Bayesian sub-modules of a model.
///
/// The values are the ones cached by the most recent forward pass, so this
/// must run after one.
#[derive(Debug, Clone, Copy, Default)]
pub struct KlDivergence;

impl KlDivergence {
    /// Create a new KL aggregator.
    pub fn new() -> Self {
        Self
    }

    /// Accumulated KL divergence of `model`; zero without Bayesian modules.
    pub fn compute<M: Model + ?Sized>(&self, model: &M) -> f64 {
        model
            .bayesian_modules()
            .iter()
            .map(|module| module.log_variational_posterior() - module.log_prior())
            .sum()
    }
}

/// Evidence lower bound: `criterion(model(x), y) + kl_weight * KL`,
/// averaged over `num_samples` stochastic forward passes.
#[derive(Debug)]
pub struct ElboLoss {
    criterion: Box<dyn Loss>,
    kl_weight: f64,
    num_samples: usize,
    kl_divergence: KlDivergence,
}

impl ElboLoss {
    /// Create a new ELBO loss.
    ///
    /// # Arguments
    /// * `criterion` - Data-fit loss applied to each sample's logits
    /// * `kl_weight` - Weight of the KL term, must be non-negative
    /// * `num_samples` - Number of forward passes averaged per call, at least 1
    pub fn new(criterion: Box<dyn Loss>, kl_weight: f64, num_samples: usize) -> TrainResult<Self> {
        if kl_weight.is_nan() || kl_weight < 0.0 {
            return Err(TrainError::ConfigError(format!(
                "The KL weight should be non-negative. Got {}.",
                kl_weight
            )));
        }
        if num_samples < 1 {
            return Err(TrainError::ConfigError(format!(
                "The number of samples should not be lower than 1. Got {}.",
                num_samples
            )));
        }
        Ok(Self {
            criterion,
            kl_weight,
            num_samples,
            kl_divergence: KlDivergence::new(),
        })
    }

    /// The data-fit criterion.
    pub fn criterion(&self) -> &dyn Loss {
        self.criterion.as_ref()
    }

    /// Weight of the KL term.
    pub fn kl_weight(&self) -> f64 {
        self.kl_weight
    }

    /// Number of forward passes per call.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Runs `num_samples` forward passes of `model` and returns the mean
    /// sampled ELBO loss.
    pub fn forward<M: Model + ?Sized>(
        &self,
        model: &mut M,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
    ) -> TrainResult<f64> {
        let mut aggregated = 0.0;
        for _ in 0..self.num_samples {
            let logits = model.forward(inputs)?;
            let data_fit = self.criterion.compute(&logits.view(), targets)?;
            let kl = self.kl_divergence.compute(model);
            aggregated += data_fit + self.kl_weight * kl;
        }
        let loss = aggregated / self.num_samples as f64;
        debug!(loss, num_samples = self.num_samples, "elbo loss");
        Ok(loss)
    }
}
