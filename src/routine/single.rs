//! Single-model classification routine.

use super::{
    ClassificationRoutine, OodCriterion, RoutineConfig, TestContext, TestSplit,
    TrainingStepOutput,
};
use crate::augmentation::{DistSim, Mixing, MixingPolicy};
use crate::batch::{Batch, BatchFormatter, IdentityFormatter};
use crate::calibration::TemperatureScaler;
use crate::data::Dataset;
use crate::logging::MetricsLogger;
use crate::loss::{Criterion, LossKind};
use crate::metrics::{
    classification_collection, ood_collection, ClassificationMetric, Entropy, Metric,
    MetricCollection, MetricValues, OodMetric,
};
use crate::model::Model;
use crate::optimizer::{OptimizationProcedure, Optimizer};
use crate::utils::{confidence, one_hot, probabilities, row_entropy, row_max};
use crate::{TrainError, TrainResult};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

/// Trains and evaluates one classifier.
///
/// Metric keys: `hp/val_*` for validation, `hp/test_*` for the
/// in-distribution test split, `hp/ts_*` for the temperature-scaled model
/// and `hp/test_{fpr95,auroc,aupr}` for OOD detection.
pub struct ClassificationSingle<M: Model> {
    pub(super) model: M,
    criterion: Criterion,
    optimization: Box<dyn OptimizationProcedure<M>>,
    pub(super) config: RoutineConfig,
    pub(super) ood_criterion: OodCriterion,
    mixing: Mixing,
    formatter: Box<dyn BatchFormatter>,
    calibration_set: Option<Dataset>,
    rng: StdRng,
    current_epoch: usize,
    pub(super) logger: MetricsLogger,
    pub(super) val_cls_metrics: MetricCollection<dyn ClassificationMetric>,
    test_cls_metrics: MetricCollection<dyn ClassificationMetric>,
    ts_cls_metrics: Option<MetricCollection<dyn ClassificationMetric>>,
    test_ood_metrics: Option<MetricCollection<dyn OodMetric>>,
    test_entropy_id: Entropy,
    test_entropy_ood: Entropy,
}

impl<M: Model> std::fmt::Debug for ClassificationSingle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassificationSingle")
            .field("config", &self.config)
            .field("ood_criterion", &self.ood_criterion)
            .field("mixing", &self.mixing.name())
            .field("criterion", &self.criterion)
            .field("current_epoch", &self.current_epoch)
            .finish_non_exhaustive()
    }
}

impl<M: Model> ClassificationSingle<M> {
    /// Build a single-model routine.
    ///
    /// # Arguments
    /// * `model` - Classifier producing `[N, num_classes]` logits
    /// * `criterion` - Training criterion
    /// * `optimization` - Builds the optimizer in
    ///   [`ClassificationRoutine::configure_optimizers`]
    /// * `config` - Routine configuration
    ///
    /// # Errors
    /// Fails with [`TrainError::ConfigError`] if more than one OOD criterion
    /// is set, if an ensemble-only criterion is set, if the mixing
    /// configuration is invalid, if a softmax cross-entropy criterion is
    /// paired with a binary task, or if embedding-space kernel warping is
    /// requested for a model without a feature extractor.
    pub fn new<P>(model: M, criterion: Criterion, optimization: P, config: RoutineConfig) -> TrainResult<Self>
    where
        P: OptimizationProcedure<M> + 'static,
    {
        Self::build(model, criterion, Box::new(optimization), config, false)
    }

    pub(super) fn build(
        model: M,
        criterion: Criterion,
        optimization: Box<dyn OptimizationProcedure<M>>,
        config: RoutineConfig,
        ensemble: bool,
    ) -> TrainResult<Self> {
        config.validate()?;
        let ood_criterion = OodCriterion::from_config(&config, ensemble)?;
        let mixing = Mixing::from_config(&config.mixing)?;
        if config.is_binary() && criterion.kind() == LossKind::CrossEntropy {
            // softmax over a single logit column is constant
            return Err(TrainError::ConfigError(
                "binary classification needs a sigmoid criterion, got softmax cross-entropy"
                    .to_string(),
            ));
        }
        if mixing.kernel_dist_sim() == Some(DistSim::Emb) && !model.has_feature_extractor() {
            return Err(TrainError::ConfigError(
                "kernel warping in embedding space needs a model with a feature extractor"
                    .to_string(),
            ));
        }

        let val_cls_metrics = classification_collection("hp/val_", config.num_classes);
        let test_cls_metrics = val_cls_metrics.clone_with_prefix("hp/test_");
        let test_ood_metrics = config.ood_detection.then(|| ood_collection("hp/test_"));
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        debug!(
            num_classes = config.num_classes,
            ood_detection = config.ood_detection,
            %ood_criterion,
            mixing = mixing.name(),
            elbo = criterion.is_elbo(),
            "built classification routine"
        );

        Ok(Self {
            model,
            criterion,
            optimization,
            config,
            ood_criterion,
            mixing,
            formatter: Box::new(IdentityFormatter),
            calibration_set: None,
            rng,
            current_epoch: 0,
            logger: MetricsLogger::new(),
            val_cls_metrics,
            test_cls_metrics,
            ts_cls_metrics: None,
            test_ood_metrics,
            test_entropy_id: Entropy::new(),
            test_entropy_ood: Entropy::new(),
        })
    }

    /// Replace the batch formatter applied after mixing.
    pub fn with_formatter<F: BatchFormatter + 'static>(mut self, formatter: F) -> Self {
        self.formatter = Box::new(formatter);
        self
    }

    /// Fit a temperature scaler on `calibration_set` at test start.
    ///
    /// Also creates the `hp/ts_*` pool for the calibrated model.
    pub fn with_calibration_set(mut self, calibration_set: Dataset) -> Self {
        self.calibration_set = Some(calibration_set);
        self.ts_cls_metrics = Some(self.val_cls_metrics.clone_with_prefix("hp/ts_"));
        self
    }

    /// Replace the scalar logger.
    pub fn with_logger(mut self, logger: MetricsLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Routine configuration.
    pub fn config(&self) -> &RoutineConfig {
        &self.config
    }

    /// Resolved OOD criterion.
    pub fn ood_criterion(&self) -> OodCriterion {
        self.ood_criterion
    }

    /// Active mixing policy.
    pub fn mixing(&self) -> &Mixing {
        &self.mixing
    }

    /// Training criterion.
    pub fn criterion(&self) -> &Criterion {
        &self.criterion
    }

    /// Epoch set by the last [`ClassificationRoutine::on_train_epoch_start`].
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Keys of the validation pool.
    pub fn validation_metric_keys(&self) -> Vec<String> {
        self.val_cls_metrics.keys()
    }

    /// Whether the routine does binary classification.
    pub fn is_binary(&self) -> bool {
        self.config.is_binary()
    }

    /// Encode labels as the target matrix the criterion and mixing policies
    /// consume: a float label column for binary classification, one-hot rows
    /// otherwise.
    pub fn encode_targets(&self, labels: &ArrayView1<usize>) -> TrainResult<Array2<f64>> {
        if self.is_binary() {
            if let Some(&bad) = labels.iter().find(|&&l| l > 1) {
                return Err(TrainError::BatchError(format!(
                    "binary classification expects labels 0 or 1, got {}",
                    bad
                )));
            }
            Ok(labels.mapv(|l| l as f64).insert_axis(ndarray::Axis(1)))
        } else {
            one_hot(labels, self.config.num_classes)
        }
    }

    /// Similarity basis for kernel warping, if the policy needs one.
    fn mixing_features(&mut self, inputs: &ArrayView2<f64>) -> TrainResult<Option<Array2<f64>>> {
        match self.mixing.kernel_dist_sim() {
            Some(DistSim::Emb) => Ok(Some(self.model.feats_forward(inputs)?)),
            Some(DistSim::Inp) => Ok(Some(inputs.to_owned())),
            None => Ok(None),
        }
    }

    pub(super) fn run_training_step(&mut self, batch: &Batch, batch_idx: usize) -> TrainResult<TrainingStepOutput> {
        let targets = self.encode_targets(&batch.targets.view())?;
        let features = self.mixing_features(&batch.inputs.view())?;
        let feature_view = features.as_ref().map(|f| f.view());
        let (inputs, targets) = self.mixing.apply(
            &batch.inputs.view(),
            &targets.view(),
            feature_view.as_ref(),
            &mut self.rng,
        )?;
        let (inputs, targets) = self.formatter.format(inputs, targets)?;

        let (loss, logits) = match &self.criterion {
            Criterion::Elbo(elbo) => (
                elbo.forward(&mut self.model, &inputs.view(), &targets.view())?,
                None,
            ),
            Criterion::Standard { loss, kind } => {
                let logits = self.model.forward(&inputs.view())?;
                let value = match kind {
                    LossKind::Evidential => {
                        loss.compute_at_epoch(&logits.view(), &targets.view(), self.current_epoch)?
                    }
                    _ => loss.compute(&logits.view(), &targets.view())?,
                };
                (value, Some(logits))
            }
        };
        if !loss.is_finite() {
            return Err(TrainError::LossError(format!(
                "non-finite training loss {} at batch {}",
                loss, batch_idx
            )));
        }

        self.logger.log_metric("train_loss", loss)?;
        debug!(epoch = self.current_epoch, batch_idx, loss, "training step");
        Ok(TrainingStepOutput {
            loss,
            inputs,
            targets,
            logits,
        })
    }

    /// Per-sample OOD scores for the criteria a single model supports.
    pub(super) fn base_ood_scores(&self, logits: &ArrayView2<f64>, probs: &ArrayView2<f64>) -> Array1<f64> {
        match self.ood_criterion {
            OodCriterion::Logits => -row_max(logits),
            OodCriterion::Entropy => row_entropy(probs),
            _ => -confidence(probs),
        }
    }

    /// Forward `inputs` through the temperature-scaled model.
    pub(super) fn calibrated_logits(
        &mut self,
        ctx: &TestContext,
        inputs: &ArrayView2<f64>,
    ) -> TrainResult<Option<Array2<f64>>> {
        match ctx.calibration() {
            Some(scaler) => Ok(Some(scaler.calibrate(&mut self.model).forward(inputs)?)),
            None => Ok(None),
        }
    }

    /// Route one test batch by dataloader index.
    ///
    /// Index 0 feeds the in-distribution pools (and the negatives of the OOD
    /// pool), index 1 the OOD pool when OOD detection is enabled. Any other
    /// index is ignored.
    ///
    /// The calibrated `hp/ts_*` pool is in-distribution only: it is updated
    /// from index 0 batches and never sees OOD samples.
    pub(super) fn dispatch_test_batch(
        &mut self,
        probs: &ArrayView2<f64>,
        scores: &ArrayView1<f64>,
        calibrated_probs: Option<&ArrayView2<f64>>,
        labels: &ArrayView1<usize>,
        dataloader_idx: usize,
    ) -> TrainResult<TestSplit> {
        match (dataloader_idx, self.test_ood_metrics.as_mut()) {
            (0, ood) => {
                self.test_cls_metrics.update(probs, labels)?;
                if let (Some(ts), Some(calibrated)) =
                    (self.ts_cls_metrics.as_mut(), calibrated_probs)
                {
                    ts.update(calibrated, labels)?;
                }
                self.test_entropy_id.update_probs(probs);
                if let Some(ood) = ood {
                    ood.update(scores, &Array1::zeros(scores.len()).view())?;
                }
                let running = self.test_entropy_id.compute()?;
                self.logger.log_metric("hp/test_entropy_id", running)?;
                Ok(TestSplit::InDistribution)
            }
            (1, Some(ood)) => {
                ood.update(scores, &Array1::ones(scores.len()).view())?;
                self.test_entropy_ood.update_probs(probs);
                let running = self.test_entropy_ood.compute()?;
                self.logger.log_metric("hp/test_entropy_ood", running)?;
                Ok(TestSplit::OutOfDistribution)
            }
            (idx, _) => {
                debug!(dataloader_idx = idx, "ignoring test batch from unrouted dataloader");
                Ok(TestSplit::Ignored)
            }
        }
    }

    pub(super) fn run_on_test_start(&mut self) -> TrainResult<TestContext> {
        let Some(calibration_set) = &self.calibration_set else {
            return Ok(TestContext::new());
        };
        let mut scaler = TemperatureScaler::new();
        scaler.fit(&mut self.model, calibration_set, self.config.is_binary())?;
        info!(temperature = scaler.temperature(), "calibrated model for testing");
        Ok(TestContext::with_calibration(scaler))
    }

    pub(super) fn run_on_test_epoch_end(&mut self, ctx: &TestContext) -> TrainResult<MetricValues> {
        let mut values = self.test_cls_metrics.compute_and_reset()?;
        if let Some(ts) = self.ts_cls_metrics.as_mut() {
            if ctx.calibration().is_some() {
                values.extend(ts.compute_and_reset()?);
            } else {
                ts.reset();
            }
        }
        if let Some(ood) = self.test_ood_metrics.as_mut() {
            values.extend(ood.compute_and_reset()?);
            values.insert(
                "hp/test_entropy_ood".to_string(),
                self.test_entropy_ood.compute()?,
            );
        }
        values.insert(
            "hp/test_entropy_id".to_string(),
            self.test_entropy_id.compute()?,
        );
        self.test_entropy_id.reset();
        self.test_entropy_ood.reset();

        self.logger.log_dict(&values)?;
        info!(num_metrics = values.len(), "test epoch finished");
        Ok(values)
    }

    pub(super) fn run_on_validation_epoch_end(&mut self) -> TrainResult<MetricValues> {
        let values = self.val_cls_metrics.compute_and_reset()?;
        self.logger.log_dict(&values)?;
        info!(epoch = self.current_epoch, ?values, "validation epoch finished");
        Ok(values)
    }

    pub(super) fn set_epoch(&mut self, epoch: usize) {
        self.current_epoch = epoch;
    }

    pub(super) fn build_optimizer(&self) -> TrainResult<Box<dyn Optimizer<M>>> {
        self.optimization.build(&self.model)
    }
}

impl<M: Model> ClassificationRoutine for ClassificationSingle<M> {
    type Model = M;

    fn model(&self) -> &M {
        &self.model
    }

    fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    fn logger_mut(&mut self) -> &mut MetricsLogger {
        &mut self.logger
    }

    fn configure_optimizers(&self) -> TrainResult<Box<dyn Optimizer<M>>> {
        self.build_optimizer()
    }

    fn on_train_epoch_start(&mut self, epoch: usize) {
        self.set_epoch(epoch);
    }

    fn training_step(&mut self, batch: &Batch, batch_idx: usize) -> TrainResult<TrainingStepOutput> {
        self.run_training_step(batch, batch_idx)
    }

    fn validation_step(&mut self, batch: &Batch, _batch_idx: usize) -> TrainResult<()> {
        let logits = self.model.forward(&batch.inputs.view())?;
        let probs = probabilities(&logits.view(), self.is_binary());
        self.val_cls_metrics.update(&probs.view(), &batch.targets.view())
    }

    fn on_validation_epoch_end(&mut self) -> TrainResult<MetricValues> {
        self.run_on_validation_epoch_end()
    }

    fn on_test_start(&mut self) -> TrainResult<TestContext> {
        self.run_on_test_start()
    }

    fn test_step(
        &mut self,
        ctx: &TestContext,
        batch: &Batch,
        _batch_idx: usize,
        dataloader_idx: usize,
    ) -> TrainResult<()> {
        let binary = self.is_binary();
        let inputs = batch.inputs.view();
        let logits = self.model.forward(&inputs)?;
        let probs = probabilities(&logits.view(), binary);
        let scores = self.base_ood_scores(&logits.view(), &probs.view());

        let calibrated = if dataloader_idx == 0 {
            self.calibrated_logits(ctx, &inputs)?
                .map(|l| probabilities(&l.view(), binary))
        } else {
            None
        };
        let calibrated_view = calibrated.as_ref().map(|p| p.view());
        self.dispatch_test_batch(
            &probs.view(),
            &scores.view(),
            calibrated_view.as_ref(),
            &batch.targets.view(),
            dataloader_idx,
        )?;
        Ok(())
    }

    fn on_test_epoch_end(&mut self, ctx: &TestContext) -> TrainResult<MetricValues> {
        self.run_on_test_epoch_end(ctx)
    }
}
