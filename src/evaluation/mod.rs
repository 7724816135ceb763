//! Held-out evaluation, model comparison and the predictions file.

pub mod metrics;
pub mod predictions;
pub mod report;

pub use metrics::{compute_metrics, RegressionMetrics};
pub use predictions::{read_predictions, write_predictions, PredictionRecord};
pub use report::{evaluate_models, evaluation_split, EvaluationReport, ModelEvaluation};
