//! Model interface consumed by the routines and the Bayesian losses.

use crate::{TrainError, TrainResult};
use ndarray::{Array1, Array2, ArrayView2};

/// A sub-module carrying variational log-densities.
///
/// Both values are produced as a side effect of the module's most recent
/// forward pass (one weight sample), so they are only meaningful after a
/// forward pass has run.
pub trait BayesianModule {
    /// Log density of the sampled weights under the variational posterior.
    fn log_variational_posterior(&self) -> f64;

    /// Log density of the sampled weights under the prior.
    fn log_prior(&self) -> f64;
}

/// Trait for models driven by the classification routines.
///
/// `forward` takes `&mut self` because stochastic models resample their
/// weights and cache per-module log-densities on every pass.
pub trait Model {
    /// Perform a forward pass through the model.
    ///
    /// # Arguments
    /// * `input` - Input batch `[N, features]`
    ///
    /// # Returns
    /// Logits `[N, C]`; ensembles stack estimators as `[M * N, C]`
    fn forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>>;

    /// Compute feature embeddings, as used by embedding-space kernel warping.
    fn feats_forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        let _ = input;
        Err(TrainError::ModelError(
            "model does not expose a feature extractor".to_string(),
        ))
    }

    /// Whether [`Model::feats_forward`] is implemented.
    fn has_feature_extractor(&self) -> bool {
        false
    }

    /// Bayesian sub-modules, in module order.
    fn bayesian_modules(&self) -> Vec<&dyn BayesianModule> {
        Vec::new()
    }
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        (**self).forward(input)
    }

    fn feats_forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        (**self).feats_forward(input)
    }

    fn has_feature_extractor(&self) -> bool {
        (**self).has_feature_extractor()
    }

    fn bayesian_modules(&self) -> Vec<&dyn BayesianModule> {
        (**self).bayesian_modules()
    }
}

/// A deterministic affine model `x W + b`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    /// Weight matrix `[input_dim, output_dim]`.
    weight: Array2<f64>,
    /// Bias `[output_dim]`.
    bias: Array1<f64>,
}

impl LinearModel {
    /// Create a zero-initialised linear model.
    ///
    /// # Arguments
    /// * `input_dim` - Input dimension
    /// * `output_dim` - Output dimension
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            weight: Array2::zeros((input_dim, output_dim)),
            bias: Array1::zeros(output_dim),
        }
    }

    /// Create a linear model from explicit parameters.
    pub fn from_parameters(weight: Array2<f64>, bias: Array1<f64>) -> TrainResult<Self> {
        if weight.ncols() != bias.len() {
            return Err(TrainError::InvalidParameter(format!(
                "bias length {} does not match output dimension {}",
                bias.len(),
                weight.ncols()
            )));
        }
        Ok(Self { weight, bias })
    }

    /// Get input dimension.
    pub fn input_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// Get output dimension.
    pub fn output_dim(&self) -> usize {
        self.weight.ncols()
    }

    /// Mutable access to the weights.
    pub fn weight_mut(&mut self) -> &mut Array2<f64> {
        &mut self.weight
    }

    /// Mutable access to the bias.
    pub fn bias_mut(&mut self) -> &mut Array1<f64> {
        &mut self.bias
    }
}

impl Model for LinearModel {
    fn forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        if input.ncols() != self.input_dim() {
            return Err(TrainError::ModelError(format!(
                "Input dimension mismatch: expected {}, got {}",
                self.input_dim(),
                input.ncols()
            )));
        }
        Ok(input.dot(&self.weight) + &self.bias)
    }

    fn feats_forward(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        Ok(input.to_owned())
    }

    fn has_feature_extractor(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_linear_model_forward() {
        let mut model =
            LinearModel::from_parameters(array![[1.0, 0.0], [0.0, 2.0]], array![0.5, -0.5])
                .unwrap();
        let out = model.forward(&array![[1.0, 1.0]].view()).unwrap();
        assert_eq!(out, array![[1.5, 1.5]]);
        assert!(model.bayesian_modules().is_empty());
    }

    #[test]
    fn test_linear_model_dimension_check() {
        let mut model = LinearModel::new(3, 2);
        assert_eq!(model.input_dim(), 3);
        assert_eq!(model.output_dim(), 2);
        assert!(model.forward(&array![[1.0, 2.0]].view()).is_err());
    }

    #[test]
    fn test_boxed_model_delegates() {
        let mut model: Box<dyn Model> = Box::new(LinearModel::new(2, 2));
        assert!(model.has_feature_extractor());
        let feats = model.feats_forward(&array![[1.0, 2.0]].view()).unwrap();
        assert_eq!(feats, array![[1.0, 2.0]]);
    }

    #[test]
    fn test_bad_parameters_rejected() {
        assert!(LinearModel::from_parameters(Array2::zeros((2, 3)), Array1::zeros(2)).is_err());
    }
}
