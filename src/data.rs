//! Datasets and data modules.
//!
//! A [`DataModule`] hands out training, validation and test batches. Test
//! data comes as an ordered list of dataloaders and routines route metrics by
//! position: index 0 is always the in-distribution test split and index 1,
//! present only when OOD detection is enabled, the out-of-distribution split.

use crate::batch::{extract_batch, Batch, BatchConfig, BatchIterator};
use crate::{TrainError, TrainResult};
use ndarray::{s, Array1, Array2};

/// Labelled classification data held in memory.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Feature matrix (samples x features).
    pub inputs: Array2<f64>,
    /// Class label of each sample.
    pub targets: Array1<usize>,
}

impl Dataset {
    /// Create a new dataset.
    pub fn new(inputs: Array2<f64>, targets: Array1<usize>) -> TrainResult<Self> {
        if inputs.nrows() != targets.len() {
            return Err(TrainError::BatchError(format!(
                "dataset has {} input rows but {} targets",
                inputs.nrows(),
                targets.len()
            )));
        }
        Ok(Self { inputs, targets })
    }

    /// Get number of samples.
    pub fn num_samples(&self) -> usize {
        self.targets.len()
    }

    /// Get number of features.
    pub fn num_features(&self) -> usize {
        self.inputs.ncols()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Split dataset into consecutive subsets.
    ///
    /// # Arguments
    /// * `ratios` - Ratios for each split (must sum to 1.0)
    pub fn split(&self, ratios: &[f64]) -> TrainResult<Vec<Dataset>> {
        let total: f64 = ratios.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(TrainError::ConfigError(format!(
                "Split ratios must sum to 1.0, got {}",
                total
            )));
        }

        let n = self.num_samples();
        let mut splits = Vec::with_capacity(ratios.len());
        let mut start = 0;
        for (i, &ratio) in ratios.iter().enumerate() {
            let end = if i == ratios.len() - 1 {
                n
            } else {
                (start + (n as f64 * ratio).round() as usize).min(n)
            };
            splits.push(Dataset {
                inputs: self.inputs.slice(s![start..end, ..]).to_owned(),
                targets: self.targets.slice(s![start..end]).to_owned(),
            });
            start = end;
        }
        Ok(splits)
    }

    /// Get a subset of the dataset by indices.
    pub fn subset(&self, indices: &[usize]) -> TrainResult<Dataset> {
        let batch = extract_batch(&self.inputs.view(), &self.targets.view(), indices)?;
        Ok(Dataset {
            inputs: batch.inputs,
            targets: batch.targets,
        })
    }

    /// Cut the dataset into batches following `config`.
    pub fn batches(&self, config: &BatchConfig) -> TrainResult<Vec<Batch>> {
        let iterator = BatchIterator::new(self.num_samples(), config.clone())?;
        self.collect_batches(iterator)
    }

    fn collect_batches(&self, iterator: impl Iterator<Item = Vec<usize>>) -> TrainResult<Vec<Batch>> {
        iterator
            .map(|indices| extract_batch(&self.inputs.view(), &self.targets.view(), &indices))
            .collect()
    }
}

/// Source of batches for a full fit/test lifecycle.
pub trait DataModule {
    /// Training batches for the next epoch.
    fn train_batches(&mut self) -> TrainResult<Vec<Batch>>;

    /// Validation batches.
    fn val_batches(&mut self) -> TrainResult<Vec<Batch>>;

    /// Test dataloaders: index 0 in-distribution, index 1 OOD when enabled.
    fn test_dataloaders(&mut self) -> TrainResult<Vec<Vec<Batch>>>;
}

/// A [`DataModule`] over in-memory datasets.
#[derive(Debug)]
pub struct InMemoryDataModule {
    train: Dataset,
    val: Dataset,
    test: Dataset,
    ood: Option<Dataset>,
    train_iter: BatchIterator,
    eval_batch_size: usize,
}

impl InMemoryDataModule {
    /// Create a data module.
    ///
    /// # Arguments
    /// * `train`, `val`, `test` - In-distribution splits
    /// * `ood` - OOD test split, served as dataloader 1 when `ood_detection`
    /// * `ood_detection` - Whether OOD evaluation is enabled
    /// * `config` - Training batch configuration; evaluation uses the same
    ///   batch size without shuffling
    pub fn new(
        train: Dataset,
        val: Dataset,
        test: Dataset,
        ood: Option<Dataset>,
        ood_detection: bool,
        config: BatchConfig,
    ) -> TrainResult<Self> {
        if ood_detection && ood.is_none() {
            return Err(TrainError::ConfigError(
                "OOD detection is enabled but no OOD test set was given".to_string(),
            ));
        }
        let width = train.num_features();
        for (name, split) in [("val", Some(&val)), ("test", Some(&test)), ("ood", ood.as_ref())] {
            if let Some(split) = split {
                if split.num_features() != width {
                    return Err(TrainError::ConfigError(format!(
                        "{} split has {} features, train has {}",
                        name,
                        split.num_features(),
                        width
                    )));
                }
            }
        }
        let eval_batch_size = config.batch_size;
        let train_iter = BatchIterator::new(train.num_samples(), config)?;
        Ok(Self {
            train,
            val,
            test,
            ood: if ood_detection { ood } else { None },
            train_iter,
            eval_batch_size,
        })
    }

    /// Number of test dataloaders served.
    pub fn num_test_dataloaders(&self) -> usize {
        1 + usize::from(self.ood.is_some())
    }
}

impl DataModule for InMemoryDataModule {
    fn train_batches(&mut self) -> TrainResult<Vec<Batch>> {
        self.train_iter.reset();
        let mut batches = Vec::with_capacity(self.train_iter.num_batches());
        while let Some(indices) = self.train_iter.next_batch() {
            batches.push(extract_batch(
                &self.train.inputs.view(),
                &self.train.targets.view(),
                &indices,
            )?);
        }
        Ok(batches)
    }

    fn val_batches(&mut self) -> TrainResult<Vec<Batch>> {
        self.val
            .batches(&BatchConfig::sequential(self.eval_batch_size))
    }

    fn test_dataloaders(&mut self) -> TrainResult<Vec<Vec<Batch>>> {
        let config = BatchConfig::sequential(self.eval_batch_size);
        let mut loaders = vec![self.test.batches(&config)?];
        if let Some(ood) = &self.ood {
            loaders.push(ood.batches(&config)?);
        }
        Ok(loaders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn toy(n: usize, offset: f64) -> Dataset {
        let inputs = Array2::from_shape_fn((n, 2), |(i, j)| offset + (i * 2 + j) as f64);
        let targets = Array1::from_shape_fn(n, |i| i % 2);
        Dataset::new(inputs, targets).unwrap()
    }

    #[test]
    fn test_dataset_length_check() {
        assert!(Dataset::new(Array2::zeros((2, 2)), array![0usize]).is_err());
    }

    #[test]
    fn test_dataset_split_and_subset() {
        let data = toy(10, 0.0);
        let splits = data.split(&[0.6, 0.4]).unwrap();
        assert_eq!(splits[0].num_samples(), 6);
        assert_eq!(splits[1].num_samples(), 4);
        assert!(data.split(&[0.5, 0.2]).is_err());

        let subset = data.subset(&[9, 0]).unwrap();
        assert_eq!(subset.targets, array![1usize, 0]);
        assert!(data.subset(&[10]).is_err());
    }

    #[test]
    fn test_sequential_batches() {
        let data = toy(5, 0.0);
        let batches = data.batches(&BatchConfig::sequential(2)).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
        assert_eq!(batches[0].inputs.row(0), data.inputs.row(0));
    }

    #[test]
    fn test_test_dataloader_order() {
        let config = BatchConfig {
            batch_size: 4,
            shuffle: true,
            drop_last: false,
            seed: Some(1),
        };
        let mut module = InMemoryDataModule::new(
            toy(8, 0.0),
            toy(4, 0.0),
            toy(4, 0.0),
            Some(toy(4, 100.0)),
            true,
            config.clone(),
        )
        .unwrap();
        assert_eq!(module.num_test_dataloaders(), 2);
        let loaders = module.test_dataloaders().unwrap();
        assert_eq!(loaders.len(), 2);
        assert!(loaders[0][0].inputs[[0, 0]] < 100.0);
        assert!(loaders[1][0].inputs[[0, 0]] >= 100.0);

        let mut without_ood =
            InMemoryDataModule::new(toy(8, 0.0), toy(4, 0.0), toy(4, 0.0), Some(toy(4, 100.0)), false, config)
                .unwrap();
        assert_eq!(without_ood.test_dataloaders().unwrap().len(), 1);
    }

    #[test]
    fn test_ood_split_required() {
        let result = InMemoryDataModule::new(
            toy(8, 0.0),
            toy(4, 0.0),
            toy(4, 0.0),
            None,
            true,
            BatchConfig::default(),
        );
        assert!(matches!(result, Err(TrainError::ConfigError(_))));
    }

    #[test]
    fn test_train_batches_reshuffle() {
        let config = BatchConfig {
            batch_size: 8,
            shuffle: true,
            drop_last: false,
            seed: Some(5),
        };
        let mut module =
            InMemoryDataModule::new(toy(8, 0.0), toy(2, 0.0), toy(2, 0.0), None, false, config)
                .unwrap();
        let first = module.train_batches().unwrap();
        let second = module.train_batches().unwrap();
        assert_eq!(first[0].len(), 8);
        let mut a: Vec<usize> = first[0].inputs.column(0).iter().map(|&v| v as usize).collect();
        let mut b: Vec<usize> = second[0].inputs.column(0).iter().map(|&v| v as usize).collect();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }
}
