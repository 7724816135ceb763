//! Regressors and cross-validated model selection over plain design matrices.

pub mod forest;
pub mod ridge;
pub mod selection;

use thiserror::Error;

pub use forest::ForestRegressor;
pub use ridge::RidgeRegressor;
pub use selection::{kfold_indices, select_and_fit, Candidate, CandidateScore, FittedRegressor};

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("not enough training rows ({found}, need at least {needed})")]
    TooFewRows { found: usize, needed: usize },

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("design matrix has {found} columns, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("normal equations are singular (alpha = {alpha})")]
    Singular { alpha: f64 },

    #[error("every candidate failed cross-validation")]
    NoViableCandidate,

    #[error("random forest: {0}")]
    Forest(String),
}
