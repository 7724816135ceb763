// src/regression/selection.rs
use indicatif::ProgressBar;
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ForestRegressor, RidgeRegressor, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Candidate {
    Ridge { alpha: f64 },
    Forest { n_trees: u16, max_depth: u16 },
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Ridge { alpha } => write!(f, "ridge(alpha={})", alpha),
            Candidate::Forest { n_trees, max_depth } => {
                write!(f, "forest(trees={}, depth={})", n_trees, max_depth)
            }
        }
    }
}

/// Cross-validated RMSE of one candidate, in target space. `None` when the
/// candidate could not be fitted on some fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub candidate: Candidate,
    pub cv_rmse: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FittedRegressor {
    Ridge(RidgeRegressor),
    Forest(ForestRegressor),
}

impl FittedRegressor {
    pub fn fit(
        candidate: &Candidate,
        x: &Array2<f64>,
        y: &Array1<f64>,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        match *candidate {
            Candidate::Ridge { alpha } => RidgeRegressor::fit(x, y, alpha).map(FittedRegressor::Ridge),
            Candidate::Forest { n_trees, max_depth } => {
                ForestRegressor::fit(x, &y.to_vec(), n_trees, max_depth, seed)
                    .map(FittedRegressor::Forest)
            }
        }
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Vec<f64>, TrainingError> {
        match self {
            FittedRegressor::Ridge(model) => model.predict(x),
            FittedRegressor::Forest(model) => model.predict(x),
        }
    }

    pub fn n_features(&self) -> usize {
        match self {
            FittedRegressor::Ridge(model) => model.n_features(),
            FittedRegressor::Forest(model) => model.n_features(),
        }
    }

    pub fn as_ridge(&self) -> Option<&RidgeRegressor> {
        match self {
            FittedRegressor::Ridge(model) => Some(model),
            FittedRegressor::Forest(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FittedRegressor::Ridge(model) => format!("ridge(alpha={})", model.alpha),
            FittedRegressor::Forest(model) => {
                format!("forest(trees={}, depth={})", model.n_trees, model.max_depth)
            }
        }
    }
}

/// Row indices of each of `k` held-out folds after a seeded shuffle.
pub fn kfold_indices(n: usize, k: usize, seed: u64) -> Vec<Vec<usize>> {
    let k = k.clamp(1, n.max(1));
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut folds = vec![Vec::new(); k];
    for (position, index) in order.into_iter().enumerate() {
        folds[position % k].push(index);
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}

fn cross_validate(
    candidate: &Candidate,
    x: &Array2<f64>,
    y: &Array1<f64>,
    folds: &[Vec<usize>],
    seed: u64,
) -> Result<f64, TrainingError> {
    let n = x.nrows();
    let mut squared_error = 0.0;
    for held_out in folds {
        let train: Vec<usize> = (0..n).filter(|i| held_out.binary_search(i).is_err()).collect();
        let model = FittedRegressor::fit(
            candidate,
            &x.select(Axis(0), &train),
            &y.select(Axis(0), &train),
            seed,
        )?;
        let predictions = model.predict(&x.select(Axis(0), held_out))?;
        squared_error += held_out
            .iter()
            .zip(predictions)
            .map(|(&i, p)| (p - y[i]).powi(2))
            .sum::<f64>();
    }
    let rmse = (squared_error / n as f64).sqrt();
    if rmse.is_finite() {
        Ok(rmse)
    } else {
        Err(TrainingError::NonFinite("cross-validation predictions"))
    }
}

/// Scores every candidate by k-fold RMSE and refits the best one on all rows.
/// Ties go to the earlier candidate.
pub fn select_and_fit(
    x: &Array2<f64>,
    y: &Array1<f64>,
    candidates: &[Candidate],
    folds: usize,
    seed: u64,
    progress: Option<&ProgressBar>,
) -> Result<(FittedRegressor, Vec<CandidateScore>), TrainingError> {
    let n = x.nrows();
    if n < 4 {
        return Err(TrainingError::TooFewRows { found: n, needed: 4 });
    }
    let fold_indices = kfold_indices(n, folds.clamp(2, n), seed);

    let mut scores = Vec::with_capacity(candidates.len());
    let mut best: Option<(usize, f64)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        if let Some(pb) = progress {
            pb.set_message(format!("CV {}", candidate));
        }
        match cross_validate(candidate, x, y, &fold_indices, seed) {
            Ok(rmse) => {
                debug!("{}: CV RMSE {:.5}", candidate, rmse);
                if best.map_or(true, |(_, b)| rmse < b) {
                    best = Some((i, rmse));
                }
                scores.push(CandidateScore {
                    candidate: *candidate,
                    cv_rmse: Some(rmse),
                    error: None,
                });
            }
            Err(e) => {
                warn!("{} failed cross-validation: {}", candidate, e);
                scores.push(CandidateScore {
                    candidate: *candidate,
                    cv_rmse: None,
                    error: Some(e.to_string()),
                });
            }
        }
        if let Some(pb) = progress {
            pb.inc(1);
        }
    }

    let (best_index, _) = best.ok_or(TrainingError::NoViableCandidate)?;
    let model = FittedRegressor::fit(&candidates[best_index], x, y, seed)?;
    Ok((model, scores))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folds_partition_rows() {
        let folds = kfold_indices(23, 5, 9);
        assert_eq!(folds.len(), 5);
        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
        assert!(folds.iter().all(|f| f.len() == 4 || f.len() == 5));
        assert_eq!(folds, kfold_indices(23, 5, 9));
    }

    #[test]
    fn test_selection_prefers_linear_model_on_linear_data() {
        let x = Array2::from_shape_fn((60, 3), |(i, j)| ((i * (j + 3)) % 17) as f64 + j as f64);
        let y = x.column(0).mapv(|v| 2.0 * v) - x.column(2).mapv(|v| 0.5 * v) + 1.0;
        let candidates = [
            Candidate::Forest {
                n_trees: 10,
                max_depth: 4,
            },
            Candidate::Ridge { alpha: 0.01 },
            Candidate::Ridge { alpha: 1000.0 },
        ];
        let (model, scores) = select_and_fit(&x, &y, &candidates, 5, 1, None).unwrap();

        assert_eq!(scores.len(), 3);
        assert_eq!(model.describe(), "ridge(alpha=0.01)");
        let ridge_rmse = scores[1].cv_rmse.unwrap();
        assert!(scores.iter().all(|s| s.cv_rmse.unwrap() >= ridge_rmse));
    }

    #[test]
    fn test_too_few_rows() {
        let x = Array2::zeros((3, 2));
        let y = Array1::zeros(3);
        assert!(matches!(
            select_and_fit(&x, &y, &[Candidate::Ridge { alpha: 1.0 }], 5, 1, None),
            Err(TrainingError::TooFewRows { found: 3, .. })
        ));
    }
}
