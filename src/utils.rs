//! Array helpers shared by the losses, metrics and routines.
//!
//! All helpers work on dense `f64` arrays laid out as `[batch, classes]`
//! or, for ensembles, `[batch, estimator, classes]`.

use crate::error::{TrainError, TrainResult};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};

/// Logistic sigmoid.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Elementwise `-p * ln(p)`, with the convention `entr(0) = 0`.
pub fn entr(p: f64) -> f64 {
    if p > 0.0 {
        -p * p.ln()
    } else if p == 0.0 {
        0.0
    } else {
        f64::NEG_INFINITY
    }
}

/// Row-wise softmax, stabilised by subtracting the row maximum.
pub fn softmax(logits: &ArrayView2<f64>) -> Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Row-wise log-softmax.
pub fn log_softmax(logits: &ArrayView2<f64>) -> Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        let lse = max + row.iter().map(|&v| (v - max).exp()).sum::<f64>().ln();
        row.mapv_inplace(|v| v - lse);
    }
    out
}

/// Converts logits into probabilities: sigmoid when `binary`, softmax otherwise.
///
/// Binary logits are a `[N, 1]` column and stay one.
pub fn probabilities(logits: &ArrayView2<f64>, binary: bool) -> Array2<f64> {
    if binary {
        logits.mapv(sigmoid)
    } else {
        softmax(logits)
    }
}

/// Expands a `[N, 1]` positive-class column into `[N, 2]` distributions.
///
/// Multi-column inputs are returned unchanged.
pub fn as_distribution(probs: &ArrayView2<f64>) -> Array2<f64> {
    if probs.ncols() != 1 {
        return probs.to_owned();
    }
    Array2::from_shape_fn((probs.nrows(), 2), |(i, j)| {
        let p = probs[[i, 0]];
        if j == 0 {
            1.0 - p
        } else {
            p
        }
    })
}

/// Same as [`as_distribution`] for `[N, M, 1]` per-estimator probabilities.
pub fn as_distribution3(probs: &ArrayView3<f64>) -> Array3<f64> {
    let (n, m, c) = probs.dim();
    if c != 1 {
        return probs.to_owned();
    }
    Array3::from_shape_fn((n, m, 2), |(i, e, j)| {
        let p = probs[[i, e, 0]];
        if j == 0 {
            1.0 - p
        } else {
            p
        }
    })
}

/// Maximum of each row.
pub fn row_max(values: &ArrayView2<f64>) -> Array1<f64> {
    values.map_axis(Axis(1), |row| {
        row.fold(f64::NEG_INFINITY, |m, &v| m.max(v))
    })
}

/// Index of the maximum of a vector (first index wins on ties).
pub fn argmax(values: &ArrayView1<f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best_value {
            best_value = v;
            best = idx;
        }
    }
    best
}

/// Confidence of each prediction: the largest class probability.
///
/// A binary `[N, 1]` column yields `max(p, 1 - p)`.
pub fn confidence(probs: &ArrayView2<f64>) -> Array1<f64> {
    if probs.ncols() == 1 {
        probs.column(0).mapv(|p| p.max(1.0 - p))
    } else {
        row_max(probs)
    }
}

/// Shannon entropy of each row distribution.
pub fn row_entropy(probs: &ArrayView2<f64>) -> Array1<f64> {
    let dist = as_distribution(probs);
    dist.map_axis(Axis(1), |row| row.iter().map(|&p| entr(p)).sum())
}

/// One-hot encodes class labels into a `[N, num_classes]` matrix.
pub fn one_hot(labels: &ArrayView1<usize>, num_classes: usize) -> TrainResult<Array2<f64>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(TrainError::InvalidParameter(format!(
                "label {} out of range for {} classes",
                label, num_classes
            )));
        }
        encoded[[i, label]] = 1.0;
    }
    Ok(encoded)
}

/// Splits stacked ensemble outputs `[M * B, C]` into `[B, M, C]`.
///
/// The estimator index varies slowest in the stacked layout, so element
/// `[b, e, c]` of the result is row `e * B + b` of the input.
pub fn rearrange_estimators(
    stacked: &ArrayView2<f64>,
    num_estimators: usize,
) -> TrainResult<Array3<f64>> {
    if num_estimators == 0 {
        return Err(TrainError::InvalidParameter(
            "num_estimators must be at least 1".to_string(),
        ));
    }
    let (rows, classes) = stacked.dim();
    if rows % num_estimators != 0 {
        return Err(TrainError::ShapeMismatch(format!(
            "{} stacked rows cannot be split across {} estimators",
            rows, num_estimators
        )));
    }
    let batch = rows / num_estimators;
    Ok(Array3::from_shape_fn(
        (batch, num_estimators, classes),
        |(b, e, c)| stacked[[e * batch + b, c]],
    ))
}

/// Averages per-estimator values `[B, M, C]` over the estimator axis.
pub fn mean_over_estimators(values: &ArrayView3<f64>) -> TrainResult<Array2<f64>> {
    values.mean_axis(Axis(1)).ok_or_else(|| {
        TrainError::ShapeMismatch("cannot average over zero estimators".to_string())
    })
}

/// Checks that two arrays have the same shape.
pub fn ensure_same_shape(what: &str, left: &[usize], right: &[usize]) -> TrainResult<()> {
    if left != right {
        return Err(TrainError::ShapeMismatch(format!(
            "{}: {:?} vs {:?}",
            what, left, right
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = array![[2.0, -2.0], [1.0, 1.0], [3.0, 0.0]];
        let probs = softmax(&logits.view());
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!((probs[[0, 0]] - 0.982_013_790_037_908).abs() < 1e-9);
        assert!((probs[[1, 0]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let logits = array![[0.3, -1.2, 2.5]];
        let log_probs = log_softmax(&logits.view());
        let probs = softmax(&logits.view());
        for j in 0..3 {
            assert!((log_probs[[0, j]].exp() - probs[[0, j]]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_sigmoid_is_stable() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(-800.0) >= 0.0);
        assert!((sigmoid(800.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_entropy_of_uniform() {
        let probs = array![[0.25, 0.25, 0.25, 0.25]];
        let h = row_entropy(&probs.view());
        assert!((h[0] - 4.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_binary_column_expands_to_distribution() {
        let probs = array![[0.8], [0.1]];
        let dist = as_distribution(&probs.view());
        assert_eq!(dist.dim(), (2, 2));
        assert!((dist[[0, 0]] - 0.2).abs() < 1e-12);
        let conf = confidence(&probs.view());
        assert!((conf[1] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_one_hot_rejects_out_of_range() {
        let labels = array![0usize, 3];
        assert!(one_hot(&labels.view(), 3).is_err());
        let encoded = one_hot(&array![2usize, 0].view(), 3).unwrap();
        assert_eq!(encoded, array![[0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_rearrange_estimators_layout() {
        let (m, b, c) = (3, 4, 5);
        let stacked = Array2::from_shape_fn((m * b, c), |(r, col)| (r * 10 + col) as f64);
        let out = rearrange_estimators(&stacked.view(), m).unwrap();
        assert_eq!(out.dim(), (b, m, c));
        for bi in 0..b {
            for e in 0..m {
                for ci in 0..c {
                    assert_eq!(out[[bi, e, ci]], stacked[[e * b + bi, ci]]);
                }
            }
        }
    }

    #[test]
    fn test_rearrange_rejects_uneven_rows() {
        let stacked = Array2::<f64>::zeros((7, 2));
        assert!(rearrange_estimators(&stacked.view(), 3).is_err());
    }
}
