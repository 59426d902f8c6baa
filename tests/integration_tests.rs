//! Integration tests for tensorlogic-uncertainty
//!
//! These tests drive the routines through the trainer the way a caller
//! would: build a routine, fit it, then test it on in-distribution and OOD
//! dataloaders.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array2, ArrayView2};
use tensorlogic_uncertainty::{
    softmax, BCEWithLogitsLoss, Batch, BatchConfig, BayesianModule, ClassificationEnsemble, ClassificationRoutine,
    ClassificationSingle, Criterion, CrossEntropyLoss, Dataset, ElboLoss, FrozenOptimizer,
    InMemoryDataModule, InMemoryLogger, LinearModel, LinearSgd, MetricsLogger, MixingPolicy, Model,
    OodCriterion, Optimizer, RoutineConfig, TestContext, TrainError, TrainResult, Trainer,
    TrainerConfig,
};

fn frozen<M: Model>(_: &M) -> TrainResult<Box<dyn Optimizer<M>>> {
    Ok(Box::new(FrozenOptimizer))
}

/// Identity weights: the inputs are the logits.
fn passthrough(num_classes: usize) -> LinearModel {
    LinearModel::from_parameters(Array2::eye(num_classes), Array1::zeros(num_classes)).unwrap()
}

/// Two well separated clusters, mirrored across the diagonal.
fn two_clusters(per_class: usize) -> Dataset {
    let mut inputs = Array2::zeros((2 * per_class, 2));
    let mut targets = Array1::zeros(2 * per_class);
    for i in 0..per_class {
        let offset = 0.1 * (i % 4) as f64;
        inputs[[2 * i, 0]] = 1.0 + offset;
        inputs[[2 * i, 1]] = 0.2 - offset / 2.0;
        inputs[[2 * i + 1, 0]] = 0.2 - offset / 2.0;
        inputs[[2 * i + 1, 1]] = 1.0 + offset;
        targets[2 * i + 1] = 1;
    }
    Dataset::new(inputs, targets).unwrap()
}

/// Test: OOD detection reference values with the maximum softmax criterion
#[test]
fn test_ood_detection_reference_values() -> Result<(), TrainError> {
    let memory = InMemoryLogger::new();
    let mut routine = ClassificationSingle::new(
        passthrough(2),
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<LinearModel>,
        RoutineConfig::new(2).with_ood_detection(true),
    )?
    .with_logger(MetricsLogger::new().with_backend(memory.clone()));
    assert_eq!(routine.ood_criterion(), OodCriterion::Confidence);

    let id = Batch::new(
        array![[2.0, -2.0], [-2.0, 2.0], [1.0, 1.0], [3.0, 0.0]],
        array![0usize, 1, 0, 0],
    )?;
    let ood = Batch::new(Array2::zeros((4, 2)), array![0usize, 0, 0, 0])?;

    let trainer = Trainer::new(TrainerConfig::default())?;
    let values = trainer.test_batches(&mut routine, &[vec![id], vec![ood]])?;

    assert_abs_diff_eq!(values["hp/test_auroc"], 0.875, epsilon = 1e-9);
    assert_abs_diff_eq!(values["hp/test_aupr"], 0.8, epsilon = 1e-9);
    assert_abs_diff_eq!(values["hp/test_fpr95"], 0.25, epsilon = 1e-9);
    // uniform predictions on the OOD split
    assert_abs_diff_eq!(values["hp/test_entropy_ood"], 2.0_f64.ln(), epsilon = 1e-9);
    assert!(values["hp/test_entropy_id"] < values["hp/test_entropy_ood"]);

    assert_eq!(memory.last_scalar("hp/test_auroc"), Some(values["hp/test_auroc"]));
    assert_eq!(memory.scalars("hp/test_entropy_id").len(), 2);
    Ok(())
}

/// Test: a second test pass starts from empty pools
#[test]
fn test_metrics_reset_between_test_passes() -> Result<(), TrainError> {
    let mut routine = ClassificationSingle::new(
        passthrough(2),
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<LinearModel>,
        RoutineConfig::new(2),
    )?;
    let trainer = Trainer::new(TrainerConfig::default())?;

    let right = Batch::new(array![[3.0, 0.0], [0.0, 3.0]], array![0usize, 1])?;
    let wrong = Batch::new(array![[3.0, 0.0], [0.0, 3.0]], array![1usize, 0])?;
    let first = trainer.test_batches(&mut routine, &[vec![right]])?;
    let second = trainer.test_batches(&mut routine, &[vec![wrong]])?;
    assert_abs_diff_eq!(first["hp/test_acc"], 1.0);
    assert_abs_diff_eq!(second["hp/test_acc"], 0.0);
    assert!(!first.contains_key("hp/test_auroc"));
    Ok(())
}

/// Test: metric pools depend on binary vs multiclass
#[test]
fn test_binary_and_multiclass_pools() -> Result<(), TrainError> {
    let trainer = Trainer::new(TrainerConfig::default())?;

    let mut binary = ClassificationSingle::new(
        LinearModel::from_parameters(array![[1.0], [-1.0]], array![0.0])?,
        Criterion::standard(BCEWithLogitsLoss),
        frozen::<LinearModel>,
        RoutineConfig::new(1),
    )?;
    let batch = Batch::new(array![[2.0, 0.0], [0.0, 2.0]], array![1usize, 0])?;
    let values = trainer.test_batches(&mut binary, &[vec![batch]])?;
    assert_abs_diff_eq!(values["hp/test_acc"], 1.0);
    assert!(values.contains_key("hp/test_brier"));
    assert!(!values.contains_key("hp/test_nll"));

    let softmax_on_one_column = ClassificationSingle::new(
        LinearModel::new(2, 1),
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<LinearModel>,
        RoutineConfig::new(1),
    );
    assert!(matches!(softmax_on_one_column, Err(TrainError::ConfigError(_))));

    let mut multiclass = ClassificationSingle::new(
        passthrough(3),
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<LinearModel>,
        RoutineConfig::new(3),
    )?;
    let batch = Batch::new(array![[2.0, 0.0, 0.0], [0.0, 0.0, 2.0]], array![0usize, 2])?;
    let values = trainer.test_batches(&mut multiclass, &[vec![batch]])?;
    for key in ["hp/test_acc", "hp/test_ece", "hp/test_brier", "hp/test_nll"] {
        assert!(values.contains_key(key), "missing {}", key);
    }
    Ok(())
}

/// Test: at most one OOD criterion, and ensemble-only criteria need an ensemble
#[test]
fn test_ood_criterion_exclusivity() {
    let single = |config: RoutineConfig| {
        ClassificationSingle::new(
            passthrough(2),
            Criterion::standard(CrossEntropyLoss::default()),
            frozen::<LinearModel>,
            config,
        )
    };
    let ensemble = |config: RoutineConfig| {
        ClassificationEnsemble::new(
            passthrough(2),
            Criterion::standard(CrossEntropyLoss::default()),
            frozen::<LinearModel>,
            config,
        )
    };

    let both = RoutineConfig::new(2).with_entropy(true).with_logits(true);
    assert!(matches!(single(both.clone()), Err(TrainError::ConfigError(_))));
    assert!(matches!(ensemble(both), Err(TrainError::ConfigError(_))));

    let mi = RoutineConfig::new(2).with_mutual_information(true).with_num_estimators(2);
    assert!(single(mi.clone()).is_err());
    assert_eq!(
        ensemble(mi).map(|r| r.ood_criterion()).ok(),
        Some(OodCriterion::MutualInformation)
    );

    let logits = RoutineConfig::new(2).with_logits(true);
    assert_eq!(
        single(logits).map(|r| r.ood_criterion()).ok(),
        Some(OodCriterion::Logits)
    );
}

/// Test: fit, validate and test a linear classifier end to end
#[test]
fn test_fit_then_test_lifecycle() -> Result<(), TrainError> {
    let train = two_clusters(8);
    let val = two_clusters(4);
    let test = two_clusters(4);
    let ood = Dataset::new(Array2::from_elem((4, 2), 0.6), Array1::zeros(4))?;
    let mut data = InMemoryDataModule::new(
        train,
        val,
        test,
        Some(ood),
        true,
        BatchConfig::sequential(16),
    )?;
    assert_eq!(data.num_test_dataloaders(), 2);

    let memory = InMemoryLogger::new();
    let mut routine = ClassificationSingle::new(
        LinearModel::new(2, 2),
        Criterion::standard(CrossEntropyLoss::default()),
        |_: &LinearModel| -> TrainResult<Box<dyn Optimizer<LinearModel>>> {
            Ok(Box::new(LinearSgd::new(0.5, 0.0)?))
        },
        RoutineConfig::new(2).with_ood_detection(true).with_seed(11),
    )?
    .with_logger(MetricsLogger::new().with_backend(memory.clone()));

    let mut trainer = Trainer::new(TrainerConfig {
        max_epochs: 5,
        ..TrainerConfig::default()
    })?;
    let history = trainer.fit(&mut routine, &mut data)?;

    assert_eq!(history.num_epochs(), 5);
    assert_eq!(trainer.global_step(), 5);
    assert!(history.train_loss[4] < history.train_loss[0]);
    assert_eq!(history.metrics["hp/val_acc"].len(), 5);
    assert_abs_diff_eq!(history.last("hp/val_acc").unwrap_or(0.0), 1.0);
    assert_eq!(memory.scalars("train_loss").len(), 5);

    let values = trainer.test(&mut routine, &mut data)?;
    assert_abs_diff_eq!(values["hp/test_acc"], 1.0);
    // the OOD points sit on the decision boundary
    assert!(values["hp/test_auroc"] > 0.9);
    assert!(!values.contains_key("hp/ts_acc"));
    Ok(())
}

/// Test: a calibration set adds the temperature-scaled pool
#[test]
fn test_calibration_adds_scaled_pool() -> Result<(), TrainError> {
    let calibration = Dataset::new(
        array![[4.0, 0.0], [0.0, 4.0], [4.0, 0.0], [0.0, 4.0]],
        array![0usize, 1, 1, 0],
    )?;
    let mut routine = ClassificationSingle::new(
        passthrough(2),
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<LinearModel>,
        RoutineConfig::new(2),
    )?
    .with_calibration_set(calibration);

    let ctx = routine.on_test_start()?;
    let temperature = ctx.calibration().map(|scaler| scaler.temperature());
    // half the confident predictions are wrong, so the logits get softened
    assert!(temperature.unwrap_or(0.0) > 1.0);

    let batch = Batch::new(array![[4.0, 0.0], [0.0, 4.0]], array![0usize, 1])?;
    routine.test_step(&ctx, &batch, 0, 0)?;
    let values = routine.on_test_epoch_end(&ctx)?;
    for key in ["hp/ts_acc", "hp/ts_ece", "hp/ts_brier", "hp/ts_nll"] {
        assert!(values.contains_key(key), "missing {}", key);
    }
    assert_abs_diff_eq!(values["hp/ts_acc"], values["hp/test_acc"]);
    assert!(values["hp/ts_nll"] > values["hp/test_nll"]);
    Ok(())
}

/// Returns preset stacked logits whatever the input.
#[derive(Debug)]
struct StackedEnsemble {
    logits: Array2<f64>,
}

impl Model for StackedEnsemble {
    fn forward(&mut self, _input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        Ok(self.logits.clone())
    }
}

fn stacked_logits(estimators: usize, batch: usize, classes: usize) -> Array2<f64> {
    Array2::from_shape_fn((estimators * batch, classes), |(row, c)| {
        ((row * classes + c) as f64 * 0.37).sin() * 3.0
    })
}

/// Test: stacked ensemble outputs are split as `[batch, estimator, class]`
#[test]
fn test_ensemble_reshape() -> Result<(), TrainError> {
    let logits = stacked_logits(3, 4, 5);
    let routine = ClassificationEnsemble::new(
        StackedEnsemble {
            logits: logits.clone(),
        },
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<StackedEnsemble>,
        RoutineConfig::new(5).with_num_estimators(3),
    )?;

    let probs = routine.estimator_probabilities(&logits.view())?;
    assert_eq!(probs.dim(), (4, 3, 5));
    let expected = softmax(&logits.view());
    for b in 0..4 {
        for e in 0..3 {
            for c in 0..5 {
                assert_abs_diff_eq!(probs[[b, e, c]], expected[[e * 4 + b, c]], epsilon = 1e-12);
            }
        }
    }

    let uneven = stacked_logits(1, 7, 5);
    assert!(matches!(
        routine.estimator_probabilities(&uneven.view()),
        Err(TrainError::ShapeMismatch(_))
    ));
    Ok(())
}

/// Test: ensemble agreement pools with mutual-information OOD scores
#[test]
fn test_ensemble_test_pass() -> Result<(), TrainError> {
    let mut routine = ClassificationEnsemble::new(
        StackedEnsemble {
            logits: stacked_logits(3, 4, 5),
        },
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<StackedEnsemble>,
        RoutineConfig::new(5)
            .with_num_estimators(3)
            .with_ood_detection(true)
            .with_mutual_information(true),
    )?;

    let batch = Batch::new(Array2::zeros((4, 1)), array![0usize, 1, 2, 3])?;
    let trainer = Trainer::new(TrainerConfig::default())?;
    let values = trainer.test_batches(&mut routine, &[vec![batch.clone()], vec![batch]])?;

    for key in [
        "hp/test_acc",
        "hp/test_auroc",
        "hp/test_id_ens_disagreement",
        "hp/test_id_ens_mi",
        "hp/test_id_ens_entropy",
        "hp/test_ood_ens_disagreement",
        "hp/test_ood_ens_mi",
        "hp/test_ood_ens_entropy",
    ] {
        assert!(values.contains_key(key), "missing {}", key);
    }
    // identical splits are indistinguishable
    assert_abs_diff_eq!(values["hp/test_auroc"], 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(
        values["hp/test_id_ens_mi"],
        values["hp/test_ood_ens_mi"],
        epsilon = 1e-12
    );
    assert!(values["hp/test_id_ens_mi"] >= 0.0);
    Ok(())
}

/// Cached variational densities of a single Bayesian layer.
#[derive(Debug)]
struct Density {
    log_posterior: f64,
    log_prior: f64,
}

impl BayesianModule for Density {
    fn log_variational_posterior(&self) -> f64 {
        self.log_posterior
    }

    fn log_prior(&self) -> f64 {
        self.log_prior
    }
}

/// Bayesian classifier with uninformative outputs and a fixed KL term.
#[derive(Debug)]
struct TinyBayesianNet {
    density: Density,
    forward_calls: usize,
}

impl Model for TinyBayesianNet {
    fn forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        self.forward_calls += 1;
        Ok(Array2::zeros((input.nrows(), 2)))
    }

    fn bayesian_modules(&self) -> Vec<&dyn BayesianModule> {
        vec![&self.density]
    }
}

/// Test: ELBO criterion through the fit loop
#[test]
fn test_elbo_training() -> Result<(), TrainError> {
    let elbo = ElboLoss::new(Box::new(CrossEntropyLoss::default()), 0.1, 3)?;
    let mut routine = ClassificationSingle::new(
        TinyBayesianNet {
            density: Density {
                log_posterior: 1.0,
                log_prior: 0.5,
            },
            forward_calls: 0,
        },
        Criterion::Elbo(elbo),
        frozen::<TinyBayesianNet>,
        RoutineConfig::new(2),
    )?;

    let dataset = two_clusters(2);
    let mut data = InMemoryDataModule::new(
        dataset.clone(),
        dataset.clone(),
        dataset,
        None,
        false,
        BatchConfig::sequential(4),
    )?;
    let mut trainer = Trainer::new(TrainerConfig {
        max_epochs: 2,
        validate_every_epoch: false,
        ..TrainerConfig::default()
    })?;
    let history = trainer.fit(&mut routine, &mut data)?;

    for loss in &history.train_loss {
        assert_abs_diff_eq!(*loss, 2.0_f64.ln() + 0.05, epsilon = 1e-12);
    }
    assert!(history.metrics.is_empty());
    // three sampled forward passes per training step
    assert_eq!(routine.model().forward_calls, 6);
    Ok(())
}

/// Test: linear SGD refuses ELBO steps, which carry no logits
#[test]
fn test_elbo_step_has_no_logits() -> Result<(), TrainError> {
    let elbo = ElboLoss::new(Box::new(CrossEntropyLoss::default()), 1.0, 1)?;
    let mut routine = ClassificationSingle::new(
        passthrough(2),
        Criterion::Elbo(elbo),
        |_: &LinearModel| -> TrainResult<Box<dyn Optimizer<LinearModel>>> {
            Ok(Box::new(LinearSgd::new(0.1, 0.0)?))
        },
        RoutineConfig::new(2),
    )?;
    let batch = Batch::new(array![[1.0, 0.0]], array![0usize])?;
    let output = routine.training_step(&batch, 0)?;
    assert!(output.logits.is_none());

    let mut optimizer = routine.configure_optimizers()?;
    assert!(matches!(
        optimizer.step(routine.model_mut(), &output),
        Err(TrainError::MissingContext(_))
    ));
    Ok(())
}

/// Test: routine configuration from JSON
#[test]
fn test_routine_config_from_json() -> Result<(), TrainError> {
    let config = RoutineConfig::from_json_str(
        r#"{
            "num_classes": 3,
            "ood_detection": true,
            "use_entropy": true,
            "seed": 5,
            "mixing": {"mixtype": "mixup", "mixup_alpha": 0.4}
        }"#,
    )?;
    let routine = ClassificationSingle::new(
        passthrough(3),
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<LinearModel>,
        config,
    )?;
    assert_eq!(routine.ood_criterion(), OodCriterion::Entropy);
    assert_eq!(routine.mixing().name(), "mixup");

    let bad = RoutineConfig::from_json_str(r#"{"num_classes": "three"}"#);
    assert!(matches!(bad, Err(TrainError::Serialization(_))));
    Ok(())
}

/// Test: the test context is empty without a calibration set
#[test]
fn test_context_without_calibration() -> Result<(), TrainError> {
    let mut routine = ClassificationSingle::new(
        passthrough(2),
        Criterion::standard(CrossEntropyLoss::default()),
        frozen::<LinearModel>,
        RoutineConfig::new(2),
    )?;
    let ctx = routine.on_test_start()?;
    assert!(ctx.calibration().is_none());
    assert!(TestContext::new().calibration().is_none());
    Ok(())
}
