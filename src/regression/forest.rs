// src/regression/forest.rs
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;

use super::TrainingError;

type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Bagged regression trees (smartcore) behind the same fit / predict contract
/// as the ridge regressor.
#[derive(Serialize, Deserialize)]
pub struct ForestRegressor {
    pub n_trees: u16,
    pub max_depth: u16,
    pub seed: u64,
    n_features: usize,
    model: Forest,
}

fn to_dense(x: &Array2<f64>) -> DenseMatrix<f64> {
    let rows: Vec<Vec<f64>> = x.rows().into_iter().map(|r| r.to_vec()).collect();
    DenseMatrix::from_2d_vec(&rows)
}

impl fmt::Debug for ForestRegressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForestRegressor")
            .field("n_trees", &self.n_trees)
            .field("max_depth", &self.max_depth)
            .field("seed", &self.seed)
            .field("n_features", &self.n_features)
            .finish_non_exhaustive()
    }
}

impl ForestRegressor {
    pub fn fit(
        x: &Array2<f64>,
        y: &[f64],
        n_trees: u16,
        max_depth: u16,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        let (n, p) = x.dim();
        if n < 2 {
            return Err(TrainingError::TooFewRows { found: n, needed: 2 });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(TrainingError::NonFinite("features"));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(TrainingError::NonFinite("targets"));
        }

        let params = RandomForestRegressorParameters::default()
            .with_n_trees(n_trees.max(1).into())
            .with_max_depth(max_depth.max(1))
            .with_seed(seed);
        let model = Forest::fit(&to_dense(x), &y.to_vec(), params)
            .map_err(|e| TrainingError::Forest(e.to_string()))?;

        Ok(Self {
            n_trees,
            max_depth,
            seed,
            n_features: p,
            model,
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<f64>, TrainingError> {
        if x.ncols() != self.n_features {
            return Err(TrainingError::DimensionMismatch {
                expected: self.n_features,
                found: x.ncols(),
            });
        }
        if x.nrows() == 0 {
            return Ok(Vec::new());
        }
        self.model
            .predict(&to_dense(x))
            .map_err(|e| TrainingError::Forest(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forest_fits_step_function_and_is_seeded() {
        let x = Array2::from_shape_fn((40, 2), |(i, j)| if j == 0 { i as f64 } else { 1.0 });
        let y: Vec<f64> = (0..40).map(|i| if i < 20 { 10.0 } else { 50.0 }).collect();

        let first = ForestRegressor::fit(&x, &y, 20, 6, 3).unwrap();
        let second = ForestRegressor::fit(&x, &y, 20, 6, 3).unwrap();
        let predictions = first.predict(&x).unwrap();
        assert_eq!(predictions, second.predict(&x).unwrap());
        assert!(predictions[2] < 30.0);
        assert!(predictions[37] > 30.0);
    }
}
