//! Classification training and evaluation routines.
//!
//! A routine is driven externally (see [`crate::Trainer`]) through
//! the hooks of [`ClassificationRoutine`]:
//!
//! ```text
//! configure_optimizers
//! for each epoch: on_train_epoch_start, training_step*, validation_step*,
//!                 on_validation_epoch_end
//! on_test_start, test_step* (per dataloader), on_test_epoch_end
//! ```
//!
//! Test batches come from an ordered list of dataloaders. Metrics are routed
//! by position: dataloader 0 must be the in-distribution split and
//! dataloader 1, present when OOD detection is enabled, the
//! out-of-distribution split. Higher indices are ignored.

mod ensemble;
mod single;

pub use ensemble::ClassificationEnsemble;
pub use single::ClassificationSingle;

use crate::augmentation::MixingConfig;
use crate::batch::Batch;
use crate::calibration::TemperatureScaler;
use crate::logging::MetricsLogger;
use crate::metrics::MetricValues;
use crate::model::Model;
use crate::optimizer::Optimizer;
use crate::{TrainError, TrainResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Configuration shared by the single-model and ensemble routines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutineConfig {
    /// Number of classes; `1` means binary classification with a single
    /// positive-class logit.
    pub num_classes: usize,
    /// Evaluate OOD detection on test dataloader 1.
    pub ood_detection: bool,
    /// Score OOD by predictive entropy.
    pub use_entropy: bool,
    /// Score OOD by the negative maximum logit.
    pub use_logits: bool,
    /// Score OOD by ensemble mutual information.
    pub use_mi: bool,
    /// Score OOD by ensemble variation ratio.
    pub use_variation_ratio: bool,
    /// Estimators stacked in the model output.
    pub num_estimators: usize,
    /// Seed for the mixing policies; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Batch mixing policy.
    pub mixing: MixingConfig,
}

impl Default for RoutineConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            ood_detection: false,
            use_entropy: false,
            use_logits: false,
            use_mi: false,
            use_variation_ratio: false,
            num_estimators: 1,
            seed: None,
            mixing: MixingConfig::default(),
        }
    }
}

impl RoutineConfig {
    /// Configuration for `num_classes` classes with defaults elsewhere.
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            ..Self::default()
        }
    }

    /// Enable or disable OOD evaluation.
    pub fn with_ood_detection(mut self, enabled: bool) -> Self {
        self.ood_detection = enabled;
        self
    }

    /// Select the entropy OOD score.
    pub fn with_entropy(mut self, enabled: bool) -> Self {
        self.use_entropy = enabled;
        self
    }

    /// Select the max-logit OOD score.
    pub fn with_logits(mut self, enabled: bool) -> Self {
        self.use_logits = enabled;
        self
    }

    /// Select the mutual information OOD score.
    pub fn with_mutual_information(mut self, enabled: bool) -> Self {
        self.use_mi = enabled;
        self
    }

    /// Select the variation ratio OOD score.
    pub fn with_variation_ratio(mut self, enabled: bool) -> Self {
        self.use_variation_ratio = enabled;
        self
    }

    /// Set the number of stacked estimators.
    pub fn with_num_estimators(mut self, num_estimators: usize) -> Self {
        self.num_estimators = num_estimators;
        self
    }

    /// Seed the mixing policies.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the mixing policy.
    pub fn with_mixing(mut self, mixing: MixingConfig) -> Self {
        self.mixing = mixing;
        self
    }

    /// Parse a JSON configuration.
    pub fn from_json_str(json: &str) -> TrainResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Whether the routine does binary classification.
    pub fn is_binary(&self) -> bool {
        self.num_classes == 1
    }

    /// Checks the fields that do not depend on the routine flavour.
    pub fn validate(&self) -> TrainResult<()> {
        if self.num_classes == 0 {
            return Err(TrainError::ConfigError(
                "num_classes must be at least 1".to_string(),
            ));
        }
        if self.num_estimators == 0 {
            return Err(TrainError::ConfigError(
                "num_estimators must be at least 1".to_string(),
            ));
        }
        self.mixing.validate()
    }
}

/// Per-sample score used to separate in- from out-of-distribution inputs.
/// Higher means more likely OOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OodCriterion {
    /// Negative maximum softmax probability.
    #[default]
    Confidence,
    /// Negative maximum logit.
    Logits,
    /// Predictive entropy.
    Entropy,
    /// Ensemble mutual information.
    MutualInformation,
    /// Ensemble variation ratio (vote based).
    VariationRatio,
}

impl OodCriterion {
    /// Resolve the configured flags, rejecting more than one.
    ///
    /// The mutual information and variation ratio flags need per-estimator
    /// predictions and are only accepted when `ensemble` is set.
    pub fn from_config(config: &RoutineConfig, ensemble: bool) -> TrainResult<Self> {
        let flags = [
            (config.use_logits, OodCriterion::Logits),
            (config.use_entropy, OodCriterion::Entropy),
            (config.use_mi, OodCriterion::MutualInformation),
            (config.use_variation_ratio, OodCriterion::VariationRatio),
        ];
        let mut selected = flags.iter().filter(|(on, _)| *on).map(|&(_, c)| c);
        let criterion = selected.next().unwrap_or_default();
        if selected.next().is_some() {
            return Err(TrainError::ConfigError(
                "You cannot choose more than one OOD criterion.".to_string(),
            ));
        }
        if !ensemble && criterion.needs_ensemble() {
            return Err(TrainError::ConfigError(format!(
                "the {} OOD criterion needs an ensemble routine",
                criterion
            )));
        }
        Ok(criterion)
    }

    /// Whether the score is computed from per-estimator predictions.
    pub fn needs_ensemble(self) -> bool {
        matches!(
            self,
            OodCriterion::MutualInformation | OodCriterion::VariationRatio
        )
    }
}

impl fmt::Display for OodCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OodCriterion::Confidence => "confidence",
            OodCriterion::Logits => "logits",
            OodCriterion::Entropy => "entropy",
            OodCriterion::MutualInformation => "mutual information",
            OodCriterion::VariationRatio => "variation ratio",
        })
    }
}

/// What a training step hands to the optimizer.
#[derive(Debug, Clone)]
pub struct TrainingStepOutput {
    /// Loss value of the step.
    pub loss: f64,
    /// Model inputs after mixing and formatting.
    pub inputs: Array2<f64>,
    /// Encoded targets after mixing and formatting.
    pub targets: Array2<f64>,
    /// Logits of the forward pass; `None` when an ELBO loss ran its own
    /// forward passes.
    pub logits: Option<Array2<f64>>,
}

/// State carried through one test phase.
///
/// Produced by [`ClassificationRoutine::on_test_start`]; holds the
/// temperature scaler when a calibration set was configured.
#[derive(Debug, Clone, Default)]
pub struct TestContext {
    calibration: Option<TemperatureScaler>,
}

impl TestContext {
    /// Context without calibration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with a fitted scaler.
    pub fn with_calibration(scaler: TemperatureScaler) -> Self {
        Self {
            calibration: Some(scaler),
        }
    }

    /// The fitted scaler, if any.
    pub fn calibration(&self) -> Option<&TemperatureScaler> {
        self.calibration.as_ref()
    }
}

/// Hooks a classification routine exposes to the trainer.
pub trait ClassificationRoutine {
    /// Model type trained by the routine.
    type Model: Model;

    /// The model.
    fn model(&self) -> &Self::Model;

    /// Mutable access to the model, for optimizer updates.
    fn model_mut(&mut self) -> &mut Self::Model;

    /// Logger the routine writes its scalars to.
    fn logger_mut(&mut self) -> &mut MetricsLogger;

    /// Build the optimizer. Called once before training.
    fn configure_optimizers(&self) -> TrainResult<Box<dyn Optimizer<Self::Model>>>;

    /// Called before the first training step of each epoch.
    fn on_train_epoch_start(&mut self, epoch: usize);

    /// Mix, format and score one training batch.
    fn training_step(&mut self, batch: &Batch, batch_idx: usize)
        -> TrainResult<TrainingStepOutput>;

    /// Update the validation metrics with one batch.
    fn validation_step(&mut self, batch: &Batch, batch_idx: usize) -> TrainResult<()>;

    /// Compute, log and reset the validation metrics.
    fn on_validation_epoch_end(&mut self) -> TrainResult<MetricValues>;

    /// Prepare the test phase, fitting calibration if configured.
    fn on_test_start(&mut self) -> TrainResult<TestContext>;

    /// Route one test batch to the metric pools of its dataloader.
    fn test_step(
        &mut self,
        ctx: &TestContext,
        batch: &Batch,
        batch_idx: usize,
        dataloader_idx: usize,
    ) -> TrainResult<()>;

    /// Compute, log and reset the test metrics.
    fn on_test_epoch_end(&mut self, ctx: &TestContext) -> TrainResult<MetricValues>;
}

/// Which pool a test batch was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TestSplit {
    InDistribution,
    OutOfDistribution,
    Ignored,
}
