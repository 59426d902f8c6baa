//! Optimizers, learning rate schedules and the optimization procedure a
//! routine builds them from.
//!
//! Models own their parameters, so an [`Optimizer`] is handed the model and
//! the [`TrainingStepOutput`] of the step it should apply.

use crate::model::LinearModel;
use crate::routine::TrainingStepOutput;
use crate::utils::probabilities;
use crate::{TrainError, TrainResult};
use ndarray::{Array1, Array2, Axis};
use std::fmt::Debug;

/// Per-epoch learning rate schedule.
pub trait LrScheduler: Debug + Send {
    /// Advance one epoch and return the new learning rate.
    fn step(&mut self) -> f64;

    /// Current learning rate.
    fn get_lr(&self) -> f64;
}

/// Step decay: multiply the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLrScheduler {
    /// Initial learning rate.
    pub initial_lr: f64,
    /// Step size (epochs).
    pub step_size: usize,
    /// Multiplicative factor of learning rate decay.
    pub gamma: f64,
    current_epoch: usize,
    current_lr: f64,
}

impl StepLrScheduler {
    /// Create a new step scheduler.
    pub fn new(initial_lr: f64, step_size: usize, gamma: f64) -> TrainResult<Self> {
        if step_size == 0 {
            return Err(TrainError::InvalidParameter(
                "step_size must be positive".to_string(),
            ));
        }
        if !(gamma > 0.0 && gamma <= 1.0) {
            return Err(TrainError::InvalidParameter(format!(
                "gamma must be in (0, 1], got {}",
                gamma
            )));
        }
        Ok(Self {
            initial_lr,
            step_size,
            gamma,
            current_epoch: 0,
            current_lr: initial_lr,
        })
    }
}

impl LrScheduler for StepLrScheduler {
    fn step(&mut self) -> f64 {
        self.current_epoch += 1;
        if self.current_epoch % self.step_size == 0 {
            self.current_lr *= self.gamma;
        }
        self.current_lr
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }
}

/// Updates a model from the output of one training step.
pub trait Optimizer<M: ?Sized>: Debug + Send {
    /// Apply one update to `model`.
    fn step(&mut self, model: &mut M, output: &TrainingStepOutput) -> TrainResult<()>;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    /// Called by the trainer after each training epoch.
    fn on_epoch_end(&mut self, _epoch: usize) {}
}

/// Leaves the model untouched. Useful to evaluate pretrained models through
/// the fit loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrozenOptimizer;

impl<M: ?Sized> Optimizer<M> for FrozenOptimizer {
    fn step(&mut self, _model: &mut M, _output: &TrainingStepOutput) -> TrainResult<()> {
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        0.0
    }
}

/// SGD with momentum for [`LinearModel`] trained with softmax cross-entropy
/// or sigmoid binary cross-entropy.
///
/// Both losses share the logit gradient `p - y`, so the update only needs the
/// step's logits, inputs and encoded targets.
#[derive(Debug)]
pub struct LinearSgd {
    learning_rate: f64,
    momentum: f64,
    weight_velocity: Option<Array2<f64>>,
    bias_velocity: Option<Array1<f64>>,
    scheduler: Option<Box<dyn LrScheduler>>,
}

impl LinearSgd {
    /// Create a new optimizer.
    pub fn new(learning_rate: f64, momentum: f64) -> TrainResult<Self> {
        if !(learning_rate > 0.0) {
            return Err(TrainError::InvalidParameter(format!(
                "learning rate must be positive, got {}",
                learning_rate
            )));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(TrainError::InvalidParameter(format!(
                "momentum must be in [0, 1), got {}",
                momentum
            )));
        }
        Ok(Self {
            learning_rate,
            momentum,
            weight_velocity: None,
            bias_velocity: None,
            scheduler: None,
        })
    }

    /// Attach a learning rate schedule, stepped at each epoch end.
    pub fn with_scheduler<S: LrScheduler + 'static>(mut self, scheduler: S) -> Self {
        self.learning_rate = scheduler.get_lr();
        self.scheduler = Some(Box::new(scheduler));
        self
    }
}

impl Optimizer<LinearModel> for LinearSgd {
    fn step(&mut self, model: &mut LinearModel, output: &TrainingStepOutput) -> TrainResult<()> {
        let logits = output.logits.as_ref().ok_or_else(|| {
            TrainError::MissingContext("LinearSgd needs the logits of the training step".to_string())
        })?;
        if logits.dim() != output.targets.dim() || logits.nrows() != output.inputs.nrows() {
            return Err(TrainError::ShapeMismatch(format!(
                "logits {:?}, targets {:?} and inputs {:?} do not line up",
                logits.dim(),
                output.targets.dim(),
                output.inputs.dim()
            )));
        }

        let n = logits.nrows().max(1) as f64;
        let residual = probabilities(&logits.view(), logits.ncols() == 1) - &output.targets;
        let grad_w = output.inputs.t().dot(&residual) / n;
        let grad_b = residual.sum_axis(Axis(0)) / n;

        let velocity_w = self
            .weight_velocity
            .get_or_insert_with(|| Array2::zeros(grad_w.raw_dim()));
        *velocity_w = &*velocity_w * self.momentum + &(grad_w * self.learning_rate);
        let velocity_b = self
            .bias_velocity
            .get_or_insert_with(|| Array1::zeros(grad_b.raw_dim()));
        *velocity_b = &*velocity_b * self.momentum + &(grad_b * self.learning_rate);

        *model.weight_mut() -= &*velocity_w;
        *model.bias_mut() -= &*velocity_b;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn on_epoch_end(&mut self, _epoch: usize) {
        if let Some(scheduler) = &mut self.scheduler {
            self.learning_rate = scheduler.step();
        }
    }
}

/// Builds the optimizer for a routine's model. Called once, when the
/// routine's optimizers are configured.
pub trait OptimizationProcedure<M: ?Sized> {
    /// Build an optimizer for `model`.
    fn build(&self, model: &M) -> TrainResult<Box<dyn Optimizer<M>>>;
}

impl<M: ?Sized, F> OptimizationProcedure<M> for F
where
    F: Fn(&M) -> TrainResult<Box<dyn Optimizer<M>>>,
{
    fn build(&self, model: &M) -> TrainResult<Box<dyn Optimizer<M>>> {
        self(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn step_output(model: &mut LinearModel) -> TrainingStepOutput {
        let inputs = array![[1.0, 0.0], [0.0, 1.0]];
        let targets = array![[1.0, 0.0], [0.0, 1.0]];
        let logits = model.forward(&inputs.view()).unwrap();
        TrainingStepOutput {
            loss: 0.0,
            inputs,
            targets,
            logits: Some(logits),
        }
    }

    #[test]
    fn test_step_scheduler() {
        let mut scheduler = StepLrScheduler::new(0.1, 2, 0.5).unwrap();
        assert_abs_diff_eq!(scheduler.step(), 0.1);
        assert_abs_diff_eq!(scheduler.step(), 0.05);
        assert_abs_diff_eq!(scheduler.get_lr(), 0.05);
        assert!(StepLrScheduler::new(0.1, 0, 0.5).is_err());
    }

    #[test]
    fn test_linear_sgd_moves_towards_targets() {
        let mut model = LinearModel::new(2, 2);
        let mut optimizer = LinearSgd::new(0.5, 0.0).unwrap();
        let output = step_output(&mut model);
        optimizer.step(&mut model, &output).unwrap();

        // p - y = [[-0.5, 0.5], [0.5, -0.5]] at zero weights
        let logits = model.forward(&array![[1.0, 0.0]].view()).unwrap();
        assert!(logits[[0, 0]] > logits[[0, 1]]);
        assert_abs_diff_eq!(model.forward(&array![[0.0, 0.0]].view()).unwrap()[[0, 0]], 0.0);
    }

    #[test]
    fn test_linear_sgd_needs_logits() {
        let mut model = LinearModel::new(2, 2);
        let mut optimizer = LinearSgd::new(0.1, 0.9).unwrap();
        let mut output = step_output(&mut model);
        output.logits = None;
        assert!(matches!(
            optimizer.step(&mut model, &output),
            Err(TrainError::MissingContext(_))
        ));
    }

    #[test]
    fn test_scheduler_drives_learning_rate() {
        let mut optimizer = LinearSgd::new(1.0, 0.0)
            .unwrap()
            .with_scheduler(StepLrScheduler::new(0.2, 1, 0.5).unwrap());
        assert_abs_diff_eq!(Optimizer::<LinearModel>::learning_rate(&optimizer), 0.2);
        Optimizer::<LinearModel>::on_epoch_end(&mut optimizer, 0);
        assert_abs_diff_eq!(Optimizer::<LinearModel>::learning_rate(&optimizer), 0.1);
    }

    #[test]
    fn test_closure_procedure() {
        let procedure = |_: &LinearModel| -> TrainResult<Box<dyn Optimizer<LinearModel>>> {
            Ok(Box::new(FrozenOptimizer))
        };
        let model = LinearModel::new(1, 1);
        let optimizer = procedure.build(&model).unwrap();
        assert_eq!(optimizer.learning_rate(), 0.0);
    }
}
