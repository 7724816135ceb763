// src/models/stats_models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The independently invocable stages of the pipeline, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Ingest,
    FetchImages,
    Extract,
    TrainTabular,
    TrainImage,
    TrainFusion,
    GradCam,
    Evaluate,
    Predict,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Ingest => "ingest",
            PipelineStage::FetchImages => "fetch_images",
            PipelineStage::Extract => "extract",
            PipelineStage::TrainTabular => "train_tabular",
            PipelineStage::TrainImage => "train_image",
            PipelineStage::TrainFusion => "train_fusion",
            PipelineStage::GradCam => "gradcam",
            PipelineStage::Evaluate => "evaluate",
            PipelineStage::Predict => "predict",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            PipelineStage::Ingest => "📥",
            PipelineStage::FetchImages => "🛰️",
            PipelineStage::Extract => "🧠",
            PipelineStage::TrainTabular => "📊",
            PipelineStage::TrainImage => "🖼️",
            PipelineStage::TrainFusion => "🔗",
            PipelineStage::GradCam => "🔥",
            PipelineStage::Evaluate => "🎯",
            PipelineStage::Predict => "🔮",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit trail of what ingestion did to the raw rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub rows_read: usize,
    pub dropped_missing_key: usize,
    pub dropped_duplicate_id: usize,
    pub dropped_invalid_coordinate: usize,
    pub dropped_outlier: usize,
    pub clipped_values: usize,
    /// Column name -> number of values filled with the column median.
    pub imputed: BTreeMap<String, usize>,
    /// Optional columns that were absent from the input entirely.
    pub absent_optional_columns: Vec<String>,
    pub rows_kept: usize,
    pub train_rows: usize,
    pub holdout_rows: usize,
    /// Input file this report describes and the SHA-256 of its contents.
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub source_digest: Option<String>,
}

impl IngestReport {
    pub fn total_dropped(&self) -> usize {
        self.dropped_missing_key
            + self.dropped_duplicate_id
            + self.dropped_invalid_coordinate
            + self.dropped_outlier
    }

    pub fn total_imputed(&self) -> usize {
        self.imputed.values().sum()
    }
}

/// Counters for one image acquisition pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionStats {
    pub requested: usize,
    pub downloaded: usize,
    pub cached: usize,
    pub missing: usize,
    pub retries: usize,
    pub skipped_over_cap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed { seconds: f64 },
    Skipped { reason: String },
    Failed { error: String },
}

/// Persisted record of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub run_id: String,
    pub run_timestamp: DateTime<Utc>,
    pub description: Option<String>,
    pub stages: BTreeMap<PipelineStage, StageOutcome>,
    pub total_processing_time: f64,
}

impl PipelineStats {
    pub fn failed_stages(&self) -> Vec<PipelineStage> {
        self.stages
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StageOutcome::Failed { .. }))
            .map(|(stage, _)| *stage)
            .collect()
    }
}
