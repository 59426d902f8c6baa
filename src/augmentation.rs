//! Batch mixing policies for training.
//!
//! Every policy maps `(inputs [N, F], targets [N, C])` to a mixed batch.
//! Targets are already encoded as float matrices (one-hot, or a binary label
//! column), so mixed outputs are soft targets.
//!
//! - [`Erm`]: identity
//! - [`TimmMixup`]: mixup or cutmix against the reversed batch, label smoothing
//! - [`Mixup`]: interpolation with a random partner (Zhang et al., ICLR 2018)
//! - [`MixupIo`]: mixed inputs, targets picked by the dominant side
//! - [`RegMixup`]: clean batch concatenated with its mixup (Pinto et al., 2022)
//! - [`WarpingMixup`]: mixup with the coefficient warped by a similarity
//!   kernel (Bouniot et al., 2023)

use crate::{TrainError, TrainResult};
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta as BetaCdf, ContinuousCDF};
use std::fmt;
use std::str::FromStr;

/// Trait for batch mixing policies.
pub trait MixingPolicy: fmt::Debug + Send {
    /// Mix a batch.
    ///
    /// # Arguments
    /// * `inputs` - Input batch `[N, F]`
    /// * `targets` - Encoded targets `[N, C]`
    /// * `features` - Similarity basis `[N, D]`, used by kernel warping only
    /// * `rng` - Random number generator
    fn apply(
        &self,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        features: Option<&ArrayView2<f64>>,
        rng: &mut StdRng,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)>;

    /// Policy name.
    fn name(&self) -> &str;
}

/// Mixing policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixType {
    /// No mixing.
    #[default]
    Erm,
    /// Mixup/CutMix with label smoothing.
    Timm,
    /// Standard mixup.
    Mixup,
    /// Mixup with separated input and output coefficients.
    MixupIo,
    /// Regularised mixup.
    #[serde(rename = "regmixup")]
    RegMixup,
    /// Similarity-kernel warped mixup.
    KernelWarping,
}

impl MixType {
    fn as_str(self) -> &'static str {
        match self {
            MixType::Erm => "erm",
            MixType::Timm => "timm",
            MixType::Mixup => "mixup",
            MixType::MixupIo => "mixup_io",
            MixType::RegMixup => "regmixup",
            MixType::KernelWarping => "kernel_warping",
        }
    }
}

impl FromStr for MixType {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "erm" => Ok(MixType::Erm),
            "timm" => Ok(MixType::Timm),
            "mixup" => Ok(MixType::Mixup),
            "mixup_io" => Ok(MixType::MixupIo),
            "regmixup" => Ok(MixType::RegMixup),
            "kernel_warping" => Ok(MixType::KernelWarping),
            other => Err(TrainError::ConfigError(format!(
                "{} is not a valid mixing type.",
                other
            ))),
        }
    }
}

impl fmt::Display for MixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Granularity of the mixing coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixMode {
    /// One coefficient per sample.
    #[default]
    Elem,
    /// One coefficient per batch.
    Batch,
}

impl FromStr for MixMode {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elem" => Ok(MixMode::Elem),
            "batch" => Ok(MixMode::Batch),
            other => Err(TrainError::ConfigError(format!(
                "{} is not a valid mixing mode.",
                other
            ))),
        }
    }
}

/// Space in which kernel warping measures sample similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistSim {
    /// Model embeddings (`feats_forward`).
    #[default]
    Emb,
    /// Raw inputs.
    Inp,
}

impl FromStr for DistSim {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emb" => Ok(DistSim::Emb),
            "inp" => Ok(DistSim::Inp),
            other => Err(TrainError::ConfigError(format!(
                "{} is not a valid similarity space.",
                other
            ))),
        }
    }
}

/// Mixing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixingConfig {
    /// Policy.
    pub mixtype: MixType,
    /// Coefficient granularity.
    pub mixmode: MixMode,
    /// Similarity space for kernel warping.
    pub dist_sim: DistSim,
    /// Beta parameter of mixup-style policies.
    pub mixup_alpha: f64,
    /// Beta parameter of cutmix.
    pub cutmix_alpha: f64,
    /// Kernel warping amplitude.
    pub kernel_tau_max: f64,
    /// Kernel warping width.
    pub kernel_tau_std: f64,
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            mixtype: MixType::Erm,
            mixmode: MixMode::Elem,
            dist_sim: DistSim::Emb,
            mixup_alpha: 0.0,
            cutmix_alpha: 0.0,
            kernel_tau_max: 1.0,
            kernel_tau_std: 0.5,
        }
    }
}

impl MixingConfig {
    /// Configuration for the given policy with default parameters.
    pub fn new(mixtype: MixType) -> Self {
        Self {
            mixtype,
            ..Self::default()
        }
    }

    /// Set the coefficient granularity.
    pub fn with_mode(mut self, mixmode: MixMode) -> Self {
        self.mixmode = mixmode;
        self
    }

    /// Set the mixup alpha.
    pub fn with_mixup_alpha(mut self, alpha: f64) -> Self {
        self.mixup_alpha = alpha;
        self
    }

    /// Set the cutmix alpha.
    pub fn with_cutmix_alpha(mut self, alpha: f64) -> Self {
        self.cutmix_alpha = alpha;
        self
    }

    /// Set the kernel warping similarity space.
    pub fn with_dist_sim(mut self, dist_sim: DistSim) -> Self {
        self.dist_sim = dist_sim;
        self
    }

    /// Set the kernel warping temperatures.
    pub fn with_kernel(mut self, tau_max: f64, tau_std: f64) -> Self {
        self.kernel_tau_max = tau_max;
        self.kernel_tau_std = tau_std;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TrainResult<()> {
        if self.mixup_alpha < 0.0
            || self.cutmix_alpha < 0.0
            || self.mixup_alpha.is_nan()
            || self.cutmix_alpha.is_nan()
        {
            return Err(TrainError::ConfigError(format!(
                "Cutmix alpha and Mixup alpha must be positive. Got {} and {}.",
                self.mixup_alpha, self.cutmix_alpha
            )));
        }
        match self.mixtype {
            MixType::Erm => {}
            MixType::Timm => {
                if self.mixup_alpha == 0.0 && self.cutmix_alpha == 0.0 {
                    return Err(TrainError::ConfigError(
                        "timm mixing needs mixup_alpha > 0 or cutmix_alpha > 0".to_string(),
                    ));
                }
            }
            MixType::Mixup | MixType::MixupIo | MixType::RegMixup | MixType::KernelWarping => {
                if self.mixup_alpha <= 0.0 {
                    return Err(TrainError::ConfigError(format!(
                        "{} mixing needs mixup_alpha > 0, got {}",
                        self.mixtype, self.mixup_alpha
                    )));
                }
            }
        }
        if self.mixtype == MixType::KernelWarping
            && !(self.kernel_tau_max > 0.0 && self.kernel_tau_std > 0.0)
        {
            return Err(TrainError::ConfigError(format!(
                "kernel temperatures must be positive, got tau_max={} and tau_std={}",
                self.kernel_tau_max, self.kernel_tau_std
            )));
        }
        Ok(())
    }
}

/// Samples mixing coefficients and a partner permutation.
#[derive(Debug, Clone)]
struct MixSampler {
    beta: Beta<f64>,
    mode: MixMode,
}

impl MixSampler {
    fn new(alpha: f64, mode: MixMode) -> TrainResult<Self> {
        let beta = Beta::new(alpha, alpha).map_err(|e| {
            TrainError::ConfigError(format!("invalid Beta({}, {}): {}", alpha, alpha, e))
        })?;
        Ok(Self { beta, mode })
    }

    /// One coefficient per sample (repeated in batch mode).
    fn lambdas(&self, n: usize, rng: &mut StdRng) -> Array1<f64> {
        match self.mode {
            MixMode::Batch => Array1::from_elem(n, self.beta.sample(rng)),
            MixMode::Elem => Array1::from_shape_fn(n, |_| self.beta.sample(rng)),
        }
    }

    fn permutation(n: usize, rng: &mut StdRng) -> Vec<usize> {
        let mut index: Vec<usize> = (0..n).collect();
        index.shuffle(rng);
        index
    }
}

fn check_rows(inputs: &ArrayView2<f64>, targets: &ArrayView2<f64>) -> TrainResult<()> {
    if inputs.nrows() != targets.nrows() {
        return Err(TrainError::BatchError(format!(
            "inputs and targets must have same number of rows: {} vs {}",
            inputs.nrows(),
            targets.nrows()
        )));
    }
    Ok(())
}

/// Row-wise `lam_i * a_i + (1 - lam_i) * a_{index_i}`.
fn linear_mix(values: &ArrayView2<f64>, lambdas: &Array1<f64>, index: &[usize]) -> Array2<f64> {
    let mut out = values.to_owned();
    for (i, mut row) in out.rows_mut().into_iter().enumerate() {
        let lam = lambdas[i];
        let partner = values.row(index[i]);
        row.zip_mut_with(&partner, |a, &b| *a = lam * *a + (1.0 - lam) * b);
    }
    out
}

/// Identity policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Erm;

impl MixingPolicy for Erm {
    fn apply(
        &self,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        _features: Option<&ArrayView2<f64>>,
        _rng: &mut StdRng,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        check_rows(inputs, targets)?;
        Ok((inputs.to_owned(), targets.to_owned()))
    }

    fn name(&self) -> &str {
        "erm"
    }
}

/// Mixup (Zhang et al., ICLR 2018).
#[derive(Debug, Clone)]
pub struct Mixup {
    sampler: MixSampler,
}

impl Mixup {
    /// Create a mixup policy with `lambda ~ Beta(alpha, alpha)`.
    pub fn new(alpha: f64, mode: MixMode) -> TrainResult<Self> {
        Ok(Self {
            sampler: MixSampler::new(alpha, mode)?,
        })
    }
}

impl MixingPolicy for Mixup {
    fn apply(
        &self,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        _features: Option<&ArrayView2<f64>>,
        rng: &mut StdRng,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        check_rows(inputs, targets)?;
        let n = inputs.nrows();
        let lambdas = self.sampler.lambdas(n, rng);
        let index = MixSampler::permutation(n, rng);
        Ok((
            linear_mix(inputs, &lambdas, &index),
            linear_mix(targets, &lambdas, &index),
        ))
    }

    fn name(&self) -> &str {
        "mixup"
    }
}

/// Mixup mixing inputs with `lambda` and picking the target of the dominant
/// side (`lambda > 0.5`).
#[derive(Debug, Clone)]
pub struct MixupIo {
    sampler: MixSampler,
}

impl MixupIo {
    /// Create a mixup-IO policy with `lambda ~ Beta(alpha, alpha)`.
    pub fn new(alpha: f64, mode: MixMode) -> TrainResult<Self> {
        Ok(Self {
            sampler: MixSampler::new(alpha, mode)?,
        })
    }
}

impl MixingPolicy for MixupIo {
    fn apply(
        &self,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        _features: Option<&ArrayView2<f64>>,
        rng: &mut StdRng,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        check_rows(inputs, targets)?;
        let n = inputs.nrows();
        let lambdas = self.sampler.lambdas(n, rng);
        let index = MixSampler::permutation(n, rng);
        let picks = lambdas.mapv(|lam| if lam > 0.5 { 1.0 } else { 0.0 });
        Ok((
            linear_mix(inputs, &lambdas, &index),
            linear_mix(targets, &picks, &index),
        ))
    }

    fn name(&self) -> &str {
        "mixup_io"
    }
}

/// RegMixup: the clean batch followed by its mixup, `2N` rows.
#[derive(Debug, Clone)]
pub struct RegMixup {
    sampler: MixSampler,
}

impl RegMixup {
    /// Create a RegMixup policy with `lambda ~ Beta(alpha, alpha)`.
    pub fn new(alpha: f64, mode: MixMode) -> TrainResult<Self> {
        Ok(Self {
            sampler: MixSampler::new(alpha, mode)?,
        })
    }
}

impl MixingPolicy for RegMixup {
    fn apply(
        &self,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        _features: Option<&ArrayView2<f64>>,
        rng: &mut StdRng,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        check_rows(inputs, targets)?;
        let n = inputs.nrows();
        let lambdas = self.sampler.lambdas(n, rng);
        let index = MixSampler::permutation(n, rng);
        let mixed_inputs = linear_mix(inputs, &lambdas, &index);
        let mixed_targets = linear_mix(targets, &lambdas, &index);
        let inputs = concatenate(Axis(0), &[inputs.view(), mixed_inputs.view()])
            .map_err(|e| TrainError::BatchError(e.to_string()))?;
        let targets = concatenate(Axis(0), &[targets.view(), mixed_targets.view()])
            .map_err(|e| TrainError::BatchError(e.to_string()))?;
        Ok((inputs, targets))
    }

    fn name(&self) -> &str {
        "regmixup"
    }
}

/// Mixup with the coefficient warped per pair by a similarity kernel.
///
/// Distant pairs get a sharper warping, pulling their coefficient toward 0
/// or 1 so that dissimilar samples are mixed less.
#[derive(Debug, Clone)]
pub struct WarpingMixup {
    sampler: MixSampler,
    apply_kernel: bool,
    tau_max: f64,
    tau_std: f64,
}

impl WarpingMixup {
    const EPS: f64 = 1e-12;

    /// Create a kernel warping policy with `lambda ~ Beta(alpha, alpha)`.
    pub fn new(alpha: f64, mode: MixMode, tau_max: f64, tau_std: f64) -> TrainResult<Self> {
        if !(tau_max > 0.0 && tau_std > 0.0) {
            return Err(TrainError::ConfigError(format!(
                "kernel temperatures must be positive, got tau_max={} and tau_std={}",
                tau_max, tau_std
            )));
        }
        Ok(Self {
            sampler: MixSampler::new(alpha, mode)?,
            apply_kernel: true,
            tau_max,
            tau_std,
        })
    }

    /// Disable the kernel: every pair is warped with parameter 1 (identity).
    pub fn without_kernel(mut self) -> Self {
        self.apply_kernel = false;
        self
    }

    /// Warping parameter of each pair from squared distances.
    fn warp_params(&self, distances: &Array1<f64>) -> Array1<f64> {
        let mean = distances.mean().unwrap_or(0.0);
        if mean <= 0.0 {
            return Array1::ones(distances.len());
        }
        distances.mapv(|d| {
            let rate = self.tau_max * (-(d - 1.0) / (mean * 2.0 * self.tau_std * self.tau_std)).exp();
            1.0 / (rate + Self::EPS)
        })
    }

    /// `BetaCDF(lambda; w + eps, w + eps)`.
    fn warp(lambda: f64, param: f64) -> TrainResult<f64> {
        let shape = param + Self::EPS;
        let dist = BetaCdf::new(shape, shape).map_err(|e| {
            TrainError::InvalidParameter(format!("invalid warping parameter {}: {}", param, e))
        })?;
        Ok(dist.cdf(lambda))
    }
}

impl MixingPolicy for WarpingMixup {
    fn apply(
        &self,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        features: Option<&ArrayView2<f64>>,
        rng: &mut StdRng,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        check_rows(inputs, targets)?;
        let n = inputs.nrows();
        let lambdas = self.sampler.lambdas(n, rng);
        let index = MixSampler::permutation(n, rng);

        let params = if self.apply_kernel {
            let feats = features.ok_or_else(|| {
                TrainError::MissingContext(
                    "kernel warping needs a similarity basis for the batch".to_string(),
                )
            })?;
            if feats.nrows() != n {
                return Err(TrainError::BatchError(format!(
                    "similarity basis has {} rows for a batch of {}",
                    feats.nrows(),
                    n
                )));
            }
            let distances = Array1::from_shape_fn(n, |i| {
                feats
                    .row(i)
                    .iter()
                    .zip(feats.row(index[i]).iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
            });
            self.warp_params(&distances)
        } else {
            Array1::ones(n)
        };

        let mut warped = Array1::zeros(n);
        for i in 0..n {
            warped[i] = Self::warp(lambdas[i], params[i])?;
        }

        Ok((
            linear_mix(inputs, &warped, &index),
            linear_mix(targets, &warped, &index),
        ))
    }

    fn name(&self) -> &str {
        "kernel_warping"
    }
}

/// Mixup/CutMix with label smoothing against the reversed batch.
///
/// With both alphas positive, each draw picks cutmix with probability
/// [`TimmMixup::SWITCH_PROB`]. CutMix replaces a contiguous span of features
/// and corrects the coefficient to the fraction actually kept.
#[derive(Debug, Clone)]
pub struct TimmMixup {
    mixup: Option<Beta<f64>>,
    cutmix: Option<Beta<f64>>,
    mode: MixMode,
    label_smoothing: f64,
}

impl TimmMixup {
    /// Probability of choosing cutmix when both are enabled.
    pub const SWITCH_PROB: f64 = 0.5;
    /// Default label smoothing.
    pub const LABEL_SMOOTHING: f64 = 0.1;

    /// Create the policy; at least one alpha must be positive.
    pub fn new(mixup_alpha: f64, cutmix_alpha: f64, mode: MixMode) -> TrainResult<Self> {
        let beta = |alpha: f64| -> TrainResult<Option<Beta<f64>>> {
            if alpha > 0.0 {
                Beta::new(alpha, alpha).map(Some).map_err(|e| {
                    TrainError::ConfigError(format!("invalid Beta({}, {}): {}", alpha, alpha, e))
                })
            } else {
                Ok(None)
            }
        };
        let mixup = beta(mixup_alpha)?;
        let cutmix = beta(cutmix_alpha)?;
        if mixup.is_none() && cutmix.is_none() {
            return Err(TrainError::ConfigError(
                "timm mixing needs mixup_alpha > 0 or cutmix_alpha > 0".to_string(),
            ));
        }
        Ok(Self {
            mixup,
            cutmix,
            mode,
            label_smoothing: Self::LABEL_SMOOTHING,
        })
    }

    /// Set label smoothing.
    pub fn with_label_smoothing(mut self, smoothing: f64) -> TrainResult<Self> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainError::ConfigError(format!(
                "label smoothing must be in [0, 1), got {}",
                smoothing
            )));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    /// Draws `(lambda, use_cutmix)`.
    fn draw(&self, rng: &mut StdRng) -> (f64, bool) {
        match (&self.mixup, &self.cutmix) {
            (Some(m), Some(c)) => {
                if rng.random::<f64>() < Self::SWITCH_PROB {
                    (c.sample(rng), true)
                } else {
                    (m.sample(rng), false)
                }
            }
            (Some(m), None) => (m.sample(rng), false),
            (None, Some(c)) => (c.sample(rng), true),
            (None, None) => (1.0, false),
        }
    }

    /// Cuts a span of `round((1 - lambda) * F)` features; returns the span and
    /// the corrected coefficient.
    fn cut_span(lambda: f64, features: usize, rng: &mut StdRng) -> (usize, usize, f64) {
        let len = (((1.0 - lambda) * features as f64).round() as usize).min(features);
        let start = rng.random_range(0..=features - len);
        let corrected = 1.0 - len as f64 / features.max(1) as f64;
        (start, start + len, corrected)
    }

    /// A single binary column is smoothed towards 0.5, one-hot rows towards
    /// the uniform distribution.
    fn smooth(&self, targets: &ArrayView2<f64>) -> Array2<f64> {
        let classes = targets.ncols().max(2) as f64;
        let off = self.label_smoothing / classes;
        targets.mapv(|t| t * (1.0 - self.label_smoothing) + off)
    }
}

impl MixingPolicy for TimmMixup {
    fn apply(
        &self,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        _features: Option<&ArrayView2<f64>>,
        rng: &mut StdRng,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        check_rows(inputs, targets)?;
        let n = inputs.nrows();
        if n % 2 != 0 {
            return Err(TrainError::BatchError(format!(
                "Batch size should be even when using timm mixing, got {}",
                n
            )));
        }
        let features = inputs.ncols();

        let mut mixed = inputs.to_owned();
        let mut lambdas = Array1::zeros(n);
        let batch_draw = match self.mode {
            MixMode::Batch => Some(self.draw(rng)),
            MixMode::Elem => None,
        };
        let batch_span = match batch_draw {
            Some((lam, true)) => Some(Self::cut_span(lam, features, rng)),
            _ => None,
        };

        for i in 0..n {
            let partner = inputs.row(n - 1 - i);
            let (lam, use_cutmix) = match batch_draw {
                Some(draw) => draw,
                None => self.draw(rng),
            };
            let mut row = mixed.row_mut(i);
            if use_cutmix {
                let (start, end, corrected) = match batch_span {
                    Some(span) => span,
                    None => Self::cut_span(lam, features, rng),
                };
                for k in start..end {
                    row[k] = partner[k];
                }
                lambdas[i] = corrected;
            } else {
                row.zip_mut_with(&partner, |a, &b| *a = lam * *a + (1.0 - lam) * b);
                lambdas[i] = lam;
            }
        }

        let smoothed = self.smooth(targets);
        let reversed: Vec<usize> = (0..n).rev().collect();
        Ok((mixed, linear_mix(&smoothed.view(), &lambdas, &reversed)))
    }

    fn name(&self) -> &str {
        "timm"
    }
}

/// The mixing policy a routine runs, chosen once from a [`MixingConfig`].
#[derive(Debug, Clone)]
pub enum Mixing {
    /// Identity.
    Erm(Erm),
    /// Mixup/CutMix with label smoothing.
    Timm(TimmMixup),
    /// Mixup.
    Mixup(Mixup),
    /// Mixup-IO.
    MixupIo(MixupIo),
    /// RegMixup.
    RegMixup(RegMixup),
    /// Kernel warping mixup, with the space similarities are measured in.
    KernelWarping(WarpingMixup, DistSim),
}

impl Mixing {
    /// Validate `config` and build the matching policy.
    pub fn from_config(config: &MixingConfig) -> TrainResult<Self> {
        config.validate()?;
        let alpha = config.mixup_alpha;
        let mode = config.mixmode;
        Ok(match config.mixtype {
            MixType::Erm => Mixing::Erm(Erm),
            MixType::Timm => Mixing::Timm(TimmMixup::new(alpha, config.cutmix_alpha, mode)?),
            MixType::Mixup => Mixing::Mixup(Mixup::new(alpha, mode)?),
            MixType::MixupIo => Mixing::MixupIo(MixupIo::new(alpha, mode)?),
            MixType::RegMixup => Mixing::RegMixup(RegMixup::new(alpha, mode)?),
            MixType::KernelWarping => Mixing::KernelWarping(
                WarpingMixup::new(alpha, mode, config.kernel_tau_max, config.kernel_tau_std)?,
                config.dist_sim,
            ),
        })
    }

    /// Similarity space when this is kernel warping.
    pub fn kernel_dist_sim(&self) -> Option<DistSim> {
        match self {
            Mixing::KernelWarping(_, dist_sim) => Some(*dist_sim),
            _ => None,
        }
    }

    fn policy(&self) -> &dyn MixingPolicy {
        match self {
            Mixing::Erm(p) => p,
            Mixing::Timm(p) => p,
            Mixing::Mixup(p) => p,
            Mixing::MixupIo(p) => p,
            Mixing::RegMixup(p) => p,
            Mixing::KernelWarping(p, _) => p,
        }
    }
}

impl Default for Mixing {
    fn default() -> Self {
        Mixing::Erm(Erm)
    }
}

impl MixingPolicy for Mixing {
    fn apply(
        &self,
        inputs: &ArrayView2<f64>,
        targets: &ArrayView2<f64>,
        features: Option<&ArrayView2<f64>>,
        rng: &mut StdRng,
    ) -> TrainResult<(Array2<f64>, Array2<f64>)> {
        self.policy().apply(inputs, targets, features, rng)
    }

    fn name(&self) -> &str {
        self.policy().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use rand::SeedableRng;

    fn create_test_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn eye(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(i, j)| if i == j { 1.0 } else { 0.0 })
    }

    #[test]
    fn test_erm_is_identity() {
        let inputs = array![[1.0, 2.0], [3.0, 4.0]];
        let targets = eye(2);
        let (x, y) = Erm
            .apply(&inputs.view(), &targets.view(), None, &mut create_test_rng())
            .unwrap();
        assert_eq!(x, inputs);
        assert_eq!(y, targets);
    }

    #[test]
    fn test_mixup_uses_same_coefficients_for_inputs_and_targets() {
        for mode in [MixMode::Batch, MixMode::Elem] {
            let mixup = Mixup::new(0.4, mode).unwrap();
            let onehot = eye(6);
            let (x, y) = mixup
                .apply(&onehot.view(), &onehot.view(), None, &mut create_test_rng())
                .unwrap();
            for (a, b) in x.iter().zip(y.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-12);
            }
            for row in y.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_mixup_batch_mode_shares_lambda() {
        let mixup = Mixup::new(1.0, MixMode::Batch).unwrap();
        let onehot = eye(5);
        let (_, y) = mixup
            .apply(&onehot.view(), &onehot.view(), None, &mut create_test_rng())
            .unwrap();
        // own-class weight is lam, or 1 when paired with itself
        let lam: Vec<f64> = (0..5).map(|i| y[[i, i]]).filter(|&v| v < 1.0).collect();
        for pair in lam.windows(2) {
            assert_abs_diff_eq!(pair[0], pair[1], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mixup_io_targets_are_hard() {
        let policy = MixupIo::new(1.0, MixMode::Elem).unwrap();
        let inputs = Array2::from_shape_fn((8, 3), |(i, j)| (i * 3 + j) as f64);
        let targets = eye(8);
        let (_, y) = policy
            .apply(&inputs.view(), &targets.view(), None, &mut create_test_rng())
            .unwrap();
        for row in y.rows() {
            assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), 1);
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_regmixup_doubles_the_batch() {
        let policy = RegMixup::new(1.0, MixMode::Batch).unwrap();
        let inputs = array![[1.0, 0.0], [0.0, 1.0], [2.0, 2.0]];
        let targets = eye(3);
        let (x, y) = policy
            .apply(&inputs.view(), &targets.view(), None, &mut create_test_rng())
            .unwrap();
        assert_eq!(x.nrows(), 6);
        assert_eq!(y.nrows(), 6);
        assert_eq!(x.slice(ndarray::s![..3, ..]), inputs);
        assert_eq!(y.slice(ndarray::s![..3, ..]), targets);
    }

    #[test]
    fn test_warping_without_kernel_matches_mixup() {
        let alpha = 0.7;
        let inputs = Array2::from_shape_fn((6, 2), |(i, j)| (i + j) as f64);
        let targets = eye(6);
        let warping = WarpingMixup::new(alpha, MixMode::Elem, 1.0, 0.5)
            .unwrap()
            .without_kernel();
        let mixup = Mixup::new(alpha, MixMode::Elem).unwrap();

        let (wx, wy) = warping
            .apply(&inputs.view(), &targets.view(), None, &mut create_test_rng())
            .unwrap();
        let (mx, my) = mixup
            .apply(&inputs.view(), &targets.view(), None, &mut create_test_rng())
            .unwrap();
        for (a, b) in wx.iter().zip(mx.iter()).chain(wy.iter().zip(my.iter())) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_warping_requires_features() {
        let policy = WarpingMixup::new(1.0, MixMode::Batch, 1.0, 0.5).unwrap();
        let inputs = array![[1.0], [2.0]];
        let targets = eye(2);
        assert!(matches!(
            policy.apply(&inputs.view(), &targets.view(), None, &mut create_test_rng()),
            Err(TrainError::MissingContext(_))
        ));

        let (x, y) = policy
            .apply(
                &inputs.view(),
                &targets.view(),
                Some(&inputs.view()),
                &mut create_test_rng(),
            )
            .unwrap();
        assert_eq!(x.dim(), (2, 1));
        for row in y.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_warp_parameters() {
        let policy = WarpingMixup::new(1.0, MixMode::Batch, 1.0, 0.5).unwrap();
        assert_eq!(policy.warp_params(&array![0.0, 0.0]), array![1.0, 1.0]);
        let params = policy.warp_params(&array![1.0, 3.0]);
        // d == 1 gives 1 / tau_max
        assert_abs_diff_eq!(params[0], 1.0, epsilon = 1e-9);
        assert!(params[1] > params[0]);
        assert_abs_diff_eq!(WarpingMixup::warp(0.3, 1.0).unwrap(), 0.3, epsilon = 1e-6);
    }

    #[test]
    fn test_timm_smoothing_and_even_batch() {
        let policy = TimmMixup::new(1.0, 0.0, MixMode::Batch).unwrap();
        let inputs = array![[1.0, 0.0], [0.0, 1.0]];
        let targets = eye(2);
        let (_, y) = policy
            .apply(&inputs.view(), &targets.view(), None, &mut create_test_rng())
            .unwrap();
        for row in y.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
            for &v in row.iter() {
                assert!((0.05 - 1e-12..=0.95 + 1e-12).contains(&v));
            }
        }

        let odd = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        assert!(policy
            .apply(&odd.view(), &eye(3).view(), None, &mut create_test_rng())
            .is_err());
    }

    #[test]
    fn test_timm_smoothing_is_symmetric_for_binary_column() {
        let policy = TimmMixup::new(1.0, 0.0, MixMode::Batch).unwrap();
        let smoothed = policy.smooth(&array![[0.0], [1.0]].view());
        assert_abs_diff_eq!(smoothed[[0, 0]], 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(smoothed[[1, 0]], 0.95, epsilon = 1e-12);

        let one_hot = policy.smooth(&eye(4).view());
        assert_abs_diff_eq!(one_hot[[0, 0]], 0.925, epsilon = 1e-12);
        assert_abs_diff_eq!(one_hot[[0, 1]], 0.025, epsilon = 1e-12);
    }

    #[test]
    fn test_timm_cutmix_copies_partner_features() {
        let policy = TimmMixup::new(0.0, 1.0, MixMode::Elem).unwrap();
        let inputs = array![[0.0, 0.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0]];
        let targets = eye(2);
        let (x, y) = policy
            .apply(&inputs.view(), &targets.view(), None, &mut create_test_rng())
            .unwrap();
        // kept fraction of row 0 is its corrected lambda
        let kept = x.row(0).iter().filter(|&&v| v == 0.0).count() as f64 / 4.0;
        let expected = kept * (1.0 - 0.1 + 0.05) + (1.0 - kept) * 0.05;
        assert_abs_diff_eq!(y[[0, 0]], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_config_validation() {
        let config = MixingConfig::new(MixType::Mixup).with_mixup_alpha(-1.0);
        assert!(matches!(
            Mixing::from_config(&config),
            Err(TrainError::ConfigError(_))
        ));
        assert!(Mixing::from_config(&MixingConfig::new(MixType::RegMixup)).is_err());
        assert!(Mixing::from_config(&MixingConfig::new(MixType::Timm)).is_err());
        assert!(Mixing::from_config(&MixingConfig::default()).is_ok());

        let warping = MixingConfig::new(MixType::KernelWarping)
            .with_mixup_alpha(1.0)
            .with_dist_sim(DistSim::Inp);
        let mixing = Mixing::from_config(&warping).unwrap();
        assert_eq!(mixing.kernel_dist_sim(), Some(DistSim::Inp));
        assert_eq!(mixing.name(), "kernel_warping");
    }

    #[test]
    fn test_names_parse() {
        assert_eq!("mixup_io".parse::<MixType>().unwrap(), MixType::MixupIo);
        assert_eq!("regmixup".parse::<MixType>().unwrap(), MixType::RegMixup);
        assert_eq!("batch".parse::<MixMode>().unwrap(), MixMode::Batch);
        assert_eq!("inp".parse::<DistSim>().unwrap(), DistSim::Inp);
        assert!("cutout".parse::<MixType>().is_err());

        let json = r#"{"mixtype":"kernel_warping","mixup_alpha":0.5}"#;
        let config: MixingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mixtype, MixType::KernelWarping);
        assert_eq!(config.kernel_tau_std, 0.5);
    }
}
