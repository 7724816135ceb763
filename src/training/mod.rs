//! Tabular, image-only and fusion price models.
//!
//! All three share one path: build a [`FeatureSchema`], lay records out as a
//! design matrix, then select a regressor by cross-validated RMSE.
//!
//! [`FeatureSchema`]: crate::models::artifact::FeatureSchema

pub mod features;
pub mod trainer;

pub use crate::regression::TrainingError;
pub use features::{build_design, build_schema, embedding_schema, DesignMatrix};
pub use trainer::{candidates_for, predict_prices, train_model};
