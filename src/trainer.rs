//! Main training loop implementation.
//!
//! The [`Trainer`] owns the control flow; a [`ClassificationRoutine`] owns
//! the model, the criterion and the metric pools and only reacts to hooks.

use crate::batch::Batch;
use crate::data::DataModule;
use crate::metrics::MetricValues;
use crate::routine::ClassificationRoutine;
use crate::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, info_span};

/// Configuration for training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Number of epochs to train.
    pub max_epochs: usize,
    /// Whether to validate after each epoch.
    pub validate_every_epoch: bool,
    /// Emit a progress event every N training steps.
    pub log_every_n_steps: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 10,
            validate_every_epoch: true,
            log_every_n_steps: 50,
        }
    }
}

/// What happened during [`Trainer::fit`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Mean training loss of each epoch.
    pub train_loss: Vec<f64>,
    /// Learning rate at the end of each epoch.
    pub learning_rate: Vec<f64>,
    /// Validation metrics, per key, one entry per validated epoch.
    pub metrics: BTreeMap<String, Vec<f64>>,
}

impl TrainingHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed epochs.
    pub fn num_epochs(&self) -> usize {
        self.train_loss.len()
    }

    /// Last recorded value of a validation metric.
    pub fn last(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(|values| values.last().copied())
    }

    fn record_validation(&mut self, values: &MetricValues) {
        for (name, &value) in values {
            self.metrics.entry(name.clone()).or_default().push(value);
        }
    }
}

/// Drives routines through fit and test.
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    config: TrainerConfig,
    global_step: usize,
}

impl Trainer {
    /// Create a new trainer.
    pub fn new(config: TrainerConfig) -> TrainResult<Self> {
        if config.max_epochs == 0 {
            return Err(TrainError::ConfigError(
                "max_epochs must be at least 1".to_string(),
            ));
        }
        if config.log_every_n_steps == 0 {
            return Err(TrainError::ConfigError(
                "log_every_n_steps must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            global_step: 0,
        })
    }

    /// Trainer configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Training steps run so far.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Train `routine` on the training batches of `data`, validating after
    /// every epoch when configured.
    pub fn fit<R, D>(&mut self, routine: &mut R, data: &mut D) -> TrainResult<TrainingHistory>
    where
        R: ClassificationRoutine,
        D: DataModule + ?Sized,
    {
        let mut optimizer = routine.configure_optimizers()?;
        let mut history = TrainingHistory::new();

        for epoch in 0..self.config.max_epochs {
            let span = info_span!("epoch", epoch);
            let _guard = span.enter();

            routine.on_train_epoch_start(epoch);
            let batches = data.train_batches()?;
            if batches.is_empty() {
                return Err(TrainError::BatchError(
                    "the data module produced no training batch".to_string(),
                ));
            }

            let mut epoch_loss = 0.0;
            for (batch_idx, batch) in batches.iter().enumerate() {
                routine.logger_mut().set_step(self.global_step);
                let output = routine.training_step(batch, batch_idx)?;
                optimizer.step(routine.model_mut(), &output)?;
                epoch_loss += output.loss;
                self.global_step += 1;
                if self.global_step % self.config.log_every_n_steps == 0 {
                    info!(step = self.global_step, loss = output.loss, "training progress");
                }
            }
            let mean_loss = epoch_loss / batches.len() as f64;
            history.train_loss.push(mean_loss);

            if self.config.validate_every_epoch {
                let values = self.validate(routine, data)?;
                history.record_validation(&values);
            }

            optimizer.on_epoch_end(epoch);
            history.learning_rate.push(optimizer.learning_rate());
            info!(
                train_loss = mean_loss,
                learning_rate = optimizer.learning_rate(),
                "epoch finished"
            );
        }

        routine.logger_mut().flush()?;
        Ok(history)
    }

    /// Run one validation pass.
    pub fn validate<R, D>(&self, routine: &mut R, data: &mut D) -> TrainResult<MetricValues>
    where
        R: ClassificationRoutine,
        D: DataModule + ?Sized,
    {
        routine.logger_mut().set_step(self.global_step);
        for (batch_idx, batch) in data.val_batches()?.iter().enumerate() {
            routine.validation_step(batch, batch_idx)?;
        }
        routine.on_validation_epoch_end()
    }

    /// Evaluate `routine` on every test dataloader of `data`.
    ///
    /// Dataloader `i` is passed to the routine as `dataloader_idx = i`.
    pub fn test<R, D>(&self, routine: &mut R, data: &mut D) -> TrainResult<MetricValues>
    where
        R: ClassificationRoutine,
        D: DataModule + ?Sized,
    {
        let loaders = data.test_dataloaders()?;
        self.test_batches(routine, &loaders)
    }

    /// Evaluate `routine` on explicit dataloaders (index 0 in-distribution,
    /// index 1 OOD).
    pub fn test_batches<R>(&self, routine: &mut R, loaders: &[Vec<Batch>]) -> TrainResult<MetricValues>
    where
        R: ClassificationRoutine,
    {
        routine.logger_mut().set_step(self.global_step);
        let ctx = routine.on_test_start()?;
        for (dataloader_idx, loader) in loaders.iter().enumerate() {
            debug!(dataloader_idx, batches = loader.len(), "testing dataloader");
            for (batch_idx, batch) in loader.iter().enumerate() {
                routine.test_step(&ctx, batch, batch_idx, dataloader_idx)?;
            }
        }
        let values = routine.on_test_epoch_end(&ctx)?;
        routine.logger_mut().flush()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trainer_config_validation() {
        assert!(Trainer::new(TrainerConfig::default()).is_ok());
        let zero_epochs = TrainerConfig {
            max_epochs: 0,
            ..TrainerConfig::default()
        };
        assert!(Trainer::new(zero_epochs).is_err());
        let zero_logging = TrainerConfig {
            log_every_n_steps: 0,
            ..TrainerConfig::default()
        };
        assert!(Trainer::new(zero_logging).is_err());
    }

    #[test]
    fn test_history_records_validation() {
        let mut history = TrainingHistory::new();
        let mut values = MetricValues::new();
        values.insert("hp/val_acc".to_string(), 0.5);
        history.record_validation(&values);
        values.insert("hp/val_acc".to_string(), 0.75);
        history.record_validation(&values);
        assert_eq!(history.metrics["hp/val_acc"], vec![0.5, 0.75]);
        assert_eq!(history.last("hp/val_acc"), Some(0.75));
        assert_eq!(history.num_epochs(), 0);
    }

    #[test]
    fn test_config_deserialises_with_defaults() {
        let config: TrainerConfig = serde_json::from_str(r#"{"max_epochs": 3}"#).unwrap();
        assert_eq!(config.max_epochs, 3);
        assert!(config.validate_every_epoch);
    }
}
