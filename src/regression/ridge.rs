// src/regression/ridge.rs
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use super::TrainingError;

/// L2-regularised least squares on standardised features, solved in closed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeRegressor {
    pub alpha: f64,
    /// Per-column mean and scale used to standardise inputs.
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    /// Coefficients in standardised space.
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl RidgeRegressor {
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>, alpha: f64) -> Result<Self, TrainingError> {
        let (n, p) = x.dim();
        if n < 2 {
            return Err(TrainingError::TooFewRows { found: n, needed: 2 });
        }
        if y.len() != n {
            return Err(TrainingError::DimensionMismatch {
                expected: n,
                found: y.len(),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(TrainingError::NonFinite("features"));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(TrainingError::NonFinite("targets"));
        }

        let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
        // Constant columns get scale 1 so they centre to zero and drop out.
        let scales = x.std_axis(Axis(0), 0.0).mapv(|s| if s > 1e-12 { s } else { 1.0 });
        let z = (x - &means) / &scales;
        let y_mean = y.mean().unwrap_or(0.0);
        let y_centered = y - y_mean;

        let mut gram = z.t().dot(&z);
        for j in 0..p {
            gram[[j, j]] += alpha;
        }
        let rhs = z.t().dot(&y_centered);
        let weights = cholesky_solve(&gram, &rhs).ok_or(TrainingError::Singular { alpha })?;

        Ok(Self {
            alpha,
            means: means.to_vec(),
            scales: scales.to_vec(),
            weights: weights.to_vec(),
            intercept: y_mean,
        })
    }

    pub fn n_features(&self) -> usize {
        self.weights.len()
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        row.iter()
            .zip(&self.means)
            .zip(&self.scales)
            .zip(&self.weights)
            .map(|(((v, m), s), w)| (v - m) / s * w)
            .sum::<f64>()
            + self.intercept
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<f64>, TrainingError> {
        if x.ncols() != self.n_features() {
            return Err(TrainingError::DimensionMismatch {
                expected: self.n_features(),
                found: x.ncols(),
            });
        }
        Ok(x.rows().into_iter().map(|row| self.predict_row(row)).collect())
    }
}

/// Solves `a x = b` for symmetric positive-definite `a`. `None` if `a` is not
/// numerically positive definite.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 1e-12 || !sum.is_finite() {
                    return None;
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    // forward: L y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }
    // backward: L^T x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in i + 1..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_recovers_linear_relationship() {
        let x = array![[1.0, 10.0], [2.0, 8.0], [3.0, 13.0], [4.0, 9.0], [5.0, 11.0]];
        let y = x.column(0).mapv(|a| 3.0 * a) + x.column(1).mapv(|b| -2.0 * b) + 7.0;
        let model = RidgeRegressor::fit(&x, &y, 1e-9).unwrap();
        let predictions = model.predict(&x).unwrap();
        for (p, t) in predictions.iter().zip(y.iter()) {
            assert!((p - t).abs() < 1e-6, "{} vs {}", p, t);
        }
    }

    #[test]
    fn test_constant_column_and_strong_penalty() {
        let x = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        let y = array![1.0, 2.0, 3.0];
        let model = RidgeRegressor::fit(&x, &y, 1e6).unwrap();
        assert_eq!(model.weights[1], 0.0);
        assert!((model.predict(&x).unwrap()[0] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let x = array![[1.0], [f64::NAN]];
        assert!(matches!(
            RidgeRegressor::fit(&x, &array![1.0, 2.0], 1.0),
            Err(TrainingError::NonFinite("features"))
        ));
        let model = RidgeRegressor::fit(&array![[1.0], [2.0]], &array![1.0, 2.0], 1.0).unwrap();
        assert!(matches!(
            model.predict(&array![[1.0, 2.0]]),
            Err(TrainingError::DimensionMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_unregularised_collinear_system_is_singular() {
        let x = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        assert!(matches!(
            RidgeRegressor::fit(&x, &array![1.0, 2.0, 3.0], 0.0),
            Err(TrainingError::Singular { .. })
        ));
    }
}
