//! Ensemble classification routine.
//!
//! The model stacks its estimators along the batch axis: for `M` estimators
//! and a batch of `B` samples it returns `[M * B, C]` logits, estimator index
//! varying slowest. Validation and test split the estimator axis back out as
//! `[B, M, C]`; training leaves the stacked logits untouched, so the
//! criterion sees them together with repeated targets (see
//! [`ClassificationEnsemble::with_repeated_targets`]) or handles the layout
//! itself.

use super::single::ClassificationSingle;
use super::{
    ClassificationRoutine, OodCriterion, RoutineConfig, TestContext, TestSplit,
    TrainingStepOutput,
};
use crate::batch::{Batch, BatchFormatter, RepeatTarget};
use crate::data::Dataset;
use crate::logging::MetricsLogger;
use crate::loss::Criterion;
use crate::metrics::{
    ensemble_collection, EnsembleMetric, MetricCollection, MetricValues, MutualInformation,
    VariationRatio,
};
use crate::model::Model;
use crate::optimizer::{OptimizationProcedure, Optimizer};
use crate::utils::{
    confidence, mean_over_estimators, probabilities, rearrange_estimators, row_entropy, row_max,
};
use crate::{TrainError, TrainResult};
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3};

/// Trains and evaluates an ensemble whose estimators are stacked in a single
/// model output.
///
/// Adds the agreement pools `hp/test_id_ens_*` and, with OOD detection,
/// `hp/test_ood_ens_*` to the metrics of [`ClassificationSingle`].
#[derive(Debug)]
pub struct ClassificationEnsemble<M: Model> {
    base: ClassificationSingle<M>,
    test_id_ens_metrics: MetricCollection<dyn EnsembleMetric>,
    test_ood_ens_metrics: Option<MetricCollection<dyn EnsembleMetric>>,
}

impl<M: Model> ClassificationEnsemble<M> {
    /// Build an ensemble routine.
    ///
    /// Accepts all four OOD criteria (`use_logits`, `use_entropy`, `use_mi`,
    /// `use_variation_ratio`), at most one at a time.
    pub fn new<P>(model: M, criterion: Criterion, optimization: P, config: RoutineConfig) -> TrainResult<Self>
    where
        P: OptimizationProcedure<M> + 'static,
    {
        let ood_detection = config.ood_detection;
        let base = ClassificationSingle::build(model, criterion, Box::new(optimization), config, true)?;
        Ok(Self {
            base,
            test_id_ens_metrics: ensemble_collection("hp/test_id_ens_"),
            test_ood_ens_metrics: ood_detection.then(|| ensemble_collection("hp/test_ood_ens_")),
        })
    }

    /// Repeat the training targets once per estimator.
    pub fn with_repeated_targets(self) -> TrainResult<Self> {
        let formatter = RepeatTarget::new(self.num_estimators())?;
        Ok(self.with_formatter(formatter))
    }

    /// Replace the batch formatter applied after mixing.
    pub fn with_formatter<F: BatchFormatter + 'static>(mut self, formatter: F) -> Self {
        self.base = self.base.with_formatter(formatter);
        self
    }

    /// Fit a temperature scaler on `calibration_set` at test start.
    pub fn with_calibration_set(mut self, calibration_set: Dataset) -> Self {
        self.base = self.base.with_calibration_set(calibration_set);
        self
    }

    /// Replace the scalar logger.
    pub fn with_logger(mut self, logger: MetricsLogger) -> Self {
        self.base = self.base.with_logger(logger);
        self
    }

    /// Number of stacked estimators.
    pub fn num_estimators(&self) -> usize {
        self.base.config.num_estimators
    }

    /// Routine configuration.
    pub fn config(&self) -> &RoutineConfig {
        self.base.config()
    }

    /// Resolved OOD criterion.
    pub fn ood_criterion(&self) -> OodCriterion {
        self.base.ood_criterion()
    }

    /// Split stacked logits into per-estimator probabilities `[B, M, C]`.
    pub fn estimator_probabilities(&self, stacked_logits: &ArrayView2<f64>) -> TrainResult<Array3<f64>> {
        let per_estimator = rearrange_estimators(stacked_logits, self.num_estimators())?;
        estimator_probabilities(&per_estimator.view(), self.base.is_binary())
    }

    fn ensemble_ood_scores(
        &self,
        per_estimator_logits: &ArrayView3<f64>,
        per_estimator_probs: &ArrayView3<f64>,
        probs: &ArrayView2<f64>,
    ) -> TrainResult<Array1<f64>> {
        Ok(match self.base.ood_criterion {
            OodCriterion::Logits => {
                let mean_logits = mean_over_estimators(per_estimator_logits)?;
                -row_max(&mean_logits.view())
            }
            OodCriterion::Entropy => row_entropy(probs),
            OodCriterion::MutualInformation => MutualInformation::per_sample(per_estimator_probs)?,
            OodCriterion::VariationRatio => {
                let estimator_first = per_estimator_probs.view().permuted_axes([1, 0, 2]);
                VariationRatio::new(false).scores(&estimator_first)?
            }
            OodCriterion::Confidence => -confidence(probs),
        })
    }
}

/// Sigmoid (binary) or softmax over the class axis of `[B, M, C]` logits.
fn estimator_probabilities(logits: &ArrayView3<f64>, binary: bool) -> TrainResult<Array3<f64>> {
    let (batch, estimators, classes) = logits.dim();
    let flat = logits
        .to_shape((batch * estimators, classes))
        .map_err(|e| TrainError::ShapeMismatch(e.to_string()))?;
    probabilities(&flat.view(), binary)
        .into_shape_with_order((batch, estimators, classes))
        .map_err(|e| TrainError::ShapeMismatch(e.to_string()))
}

impl<M: Model> ClassificationRoutine for ClassificationEnsemble<M> {
    type Model = M;

    fn model(&self) -> &M {
        &self.base.model
    }

    fn model_mut(&mut self) -> &mut M {
        &mut self.base.model
    }

    fn logger_mut(&mut self) -> &mut MetricsLogger {
        &mut self.base.logger
    }

    fn configure_optimizers(&self) -> TrainResult<Box<dyn Optimizer<M>>> {
        self.base.build_optimizer()
    }

    fn on_train_epoch_start(&mut self, epoch: usize) {
        self.base.set_epoch(epoch);
    }

    fn training_step(&mut self, batch: &Batch, batch_idx: usize) -> TrainResult<TrainingStepOutput> {
        self.base.run_training_step(batch, batch_idx)
    }

    fn validation_step(&mut self, batch: &Batch, _batch_idx: usize) -> TrainResult<()> {
        let logits = self.base.model.forward(&batch.inputs.view())?;
        let per_estimator = self.estimator_probabilities(&logits.view())?;
        let probs = mean_over_estimators(&per_estimator.view())?;
        self.base
            .val_cls_metrics
            .update(&probs.view(), &batch.targets.view())
    }

    fn on_validation_epoch_end(&mut self) -> TrainResult<MetricValues> {
        self.base.run_on_validation_epoch_end()
    }

    fn on_test_start(&mut self) -> TrainResult<TestContext> {
        self.base.run_on_test_start()
    }

    fn test_step(
        &mut self,
        ctx: &TestContext,
        batch: &Batch,
        _batch_idx: usize,
        dataloader_idx: usize,
    ) -> TrainResult<()> {
        let inputs = batch.inputs.view();
        let logits = self.base.model.forward(&inputs)?;
        let per_estimator_logits = rearrange_estimators(&logits.view(), self.num_estimators())?;
        let per_estimator_probs =
            estimator_probabilities(&per_estimator_logits.view(), self.base.is_binary())?;
        let probs = mean_over_estimators(&per_estimator_probs.view())?;
        let scores = self.ensemble_ood_scores(
            &per_estimator_logits.view(),
            &per_estimator_probs.view(),
            &probs.view(),
        )?;

        let calibrated: Option<Array2<f64>> = if dataloader_idx == 0 {
            match self.base.calibrated_logits(ctx, &inputs)? {
                Some(cal_logits) => {
                    let per_estimator = self.estimator_probabilities(&cal_logits.view())?;
                    Some(mean_over_estimators(&per_estimator.view())?)
                }
                None => None,
            }
        } else {
            None
        };
        let calibrated_view = calibrated.as_ref().map(|p| p.view());

        let split = self.base.dispatch_test_batch(
            &probs.view(),
            &scores.view(),
            calibrated_view.as_ref(),
            &batch.targets.view(),
            dataloader_idx,
        )?;
        match (split, self.test_ood_ens_metrics.as_mut()) {
            (TestSplit::InDistribution, _) => {
                self.test_id_ens_metrics.update(&per_estimator_probs.view())?
            }
            (TestSplit::OutOfDistribution, Some(ood)) => ood.update(&per_estimator_probs.view())?,
            _ => {}
        }
        Ok(())
    }

    fn on_test_epoch_end(&mut self, ctx: &TestContext) -> TrainResult<MetricValues> {
        let mut values = self.base.run_on_test_epoch_end(ctx)?;
        let mut ensemble_values = self.test_id_ens_metrics.compute_and_reset()?;
        if let Some(ood) = self.test_ood_ens_metrics.as_mut() {
            ensemble_values.extend(ood.compute_and_reset()?);
        }
        self.base.logger.log_dict(&ensemble_values)?;
        values.extend(ensemble_values);
        Ok(values)
    }
}
