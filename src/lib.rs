//! Uncertainty-aware classification routines, evidential and Bayesian losses.
//!
//! **Version**: 0.1.0-alpha.2
//!
//! This crate provides the training and evaluation machinery for uncertainty
//! quantification on classifiers:
//! - Classification routines for single models and stacked ensembles
//! - OOD detection with confidence, logit, entropy, mutual information and
//!   variation ratio scores
//! - Evidential losses (Dirichlet classification, Normal-Inverse-Gamma
//!   regression) and the ELBO loss for Bayesian networks
//! - Mixup-family batch mixing policies
//! - Post-hoc temperature scaling
//! - Calibration, classification, OOD and ensemble-agreement metrics
//! - A trainer loop, data modules and metric logging
//!
//! # Test dataloader ordering
//!
//! Test metrics are routed by dataloader position: index 0 must yield
//! in-distribution batches and index 1, when OOD detection is enabled, OOD
//! batches. [`InMemoryDataModule`] serves its splits in that order.

mod augmentation;
mod batch;
mod bayesian;
mod calibration;
mod data;
mod error;
mod evidential;
mod logging;
mod loss;
mod metrics;
mod model;
mod optimizer;
mod routine;
mod trainer;
mod utils;

#[cfg(feature = "structured-logging")]
pub mod structured_logging;

pub use augmentation::{
    DistSim, Erm, MixMode, MixType, Mixing, MixingConfig, MixingPolicy, Mixup, MixupIo, RegMixup,
    TimmMixup, WarpingMixup,
};
pub use batch::{
    extract_batch, Batch, BatchConfig, BatchFormatter, BatchIterator, IdentityFormatter,
    RepeatTarget,
};
pub use bayesian::{ElboLoss, KlDivergence};
pub use calibration::{CalibratedModel, TemperatureScaler};
pub use data::{DataModule, Dataset, InMemoryDataModule};
pub use error::{TrainError, TrainResult};
pub use evidential::{DecLoss, DecLossType, NigLoss};
pub use logging::{
    ConsoleLogger, InMemoryLogger, JsonlLogger, LogRecord, LoggingBackend, MetricsLogger,
};
pub use loss::{
    BCEWithLogitsLoss, Criterion, CrossEntropyLoss, Loss, LossKind, LossOutput, Reduction,
};
pub use metrics::{
    classification_collection, ensemble_collection, ood_collection, Accuracy, Auroc,
    AveragePrecision, BinaryAccuracy, BinaryCalibrationError, BrierScore, CalibrationError,
    ClassificationMetric, Disagreement, EnsembleMetric, Entropy, Fpr95, Metric, MetricCollection,
    MetricValues, MutualInformation, NegativeLogLikelihood, OodMetric, VariationRatio,
};
pub use model::{BayesianModule, LinearModel, Model};
pub use optimizer::{
    FrozenOptimizer, LinearSgd, LrScheduler, OptimizationProcedure, Optimizer, StepLrScheduler,
};
pub use routine::{
    ClassificationEnsemble, ClassificationRoutine, ClassificationSingle, OodCriterion,
    RoutineConfig, TestContext, TrainingStepOutput,
};
pub use trainer::{Trainer, TrainerConfig, TrainingHistory};
pub use utils::{
    confidence, mean_over_estimators, one_hot, probabilities, rearrange_estimators, row_entropy,
    softmax,
};
