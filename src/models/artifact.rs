// src/models/artifact.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use super::property::TabularColumn;
use crate::embedding::MissingImagePolicy;
use crate::regression::{CandidateScore, FittedRegressor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Tabular,
    Image,
    Fusion,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Tabular, ModelKind::Image, ModelKind::Fusion];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Tabular => "tabular",
            ModelKind::Image => "image",
            ModelKind::Fusion => "fusion",
        }
    }

    pub fn uses_tabular(&self) -> bool {
        matches!(self, ModelKind::Tabular | ModelKind::Fusion)
    }

    pub fn uses_images(&self) -> bool {
        matches!(self, ModelKind::Image | ModelKind::Fusion)
    }

    pub fn artifact_file_name(&self) -> String {
        format!("model_{}.json", self.as_str())
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tabular" => Ok(ModelKind::Tabular),
            "image" => Ok(ModelKind::Image),
            "fusion" => Ok(ModelKind::Fusion),
            other => Err(format!("unknown model kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSchema {
    pub dim: usize,
    pub backbone_fingerprint: String,
}

/// Exactly which inputs, in which order, a trained model consumes.
/// Layout: `[tabular columns | embedding | has_image]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub kind: ModelKind,
    pub tabular_columns: Vec<TabularColumn>,
    /// Optional columns the training data lacked entirely.
    #[serde(default)]
    pub omitted_columns: Vec<TabularColumn>,
    pub embedding: Option<EmbeddingSchema>,
    pub missing_image_policy: Option<MissingImagePolicy>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("schema mismatch for {what}: model expects {expected}, found {found}")]
    Mismatch {
        what: &'static str,
        expected: String,
        found: String,
    },

    #[error("{0} model needs image embeddings but none were provided")]
    EmbeddingsRequired(ModelKind),
}

impl FeatureSchema {
    pub fn has_image_indicator(&self) -> bool {
        self.embedding.is_some() && self.missing_image_policy == Some(MissingImagePolicy::ZeroFill)
    }

    pub fn width(&self) -> usize {
        self.tabular_columns.len()
            + self.embedding.as_ref().map_or(0, |e| e.dim)
            + usize::from(self.has_image_indicator())
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tabular_columns
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        if let Some(embedding) = &self.embedding {
            names.extend((0..embedding.dim).map(|i| format!("emb_{}", i)));
        }
        if self.has_image_indicator() {
            names.push("has_image".to_string());
        }
        names
    }

    /// Checks that the presented columns and embeddings match what the model was trained on.
    pub fn check_inputs(
        &self,
        available_columns: &[TabularColumn],
        embedding: Option<&EmbeddingSchema>,
    ) -> Result<(), SchemaError> {
        let missing: Vec<&str> = self
            .tabular_columns
            .iter()
            .filter(|c| !available_columns.contains(c))
            .map(|c| c.name())
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::Mismatch {
                what: "tabular columns",
                expected: names(&self.tabular_columns),
                found: format!("input lacking {}", missing.join(", ")),
            });
        }

        match (&self.embedding, embedding) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(SchemaError::EmbeddingsRequired(self.kind)),
            (Some(expected), Some(found)) => {
                if expected.dim != found.dim {
                    return Err(SchemaError::Mismatch {
                        what: "embedding dimension",
                        expected: expected.dim.to_string(),
                        found: found.dim.to_string(),
                    });
                }
                if expected.backbone_fingerprint != found.backbone_fingerprint {
                    return Err(SchemaError::Mismatch {
                        what: "backbone fingerprint",
                        expected: expected.backbone_fingerprint.clone(),
                        found: found.backbone_fingerprint.clone(),
                    });
                }
                Ok(())
            }
        }
    }
}

fn names(columns: &[TabularColumn]) -> String {
    columns.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
}

/// A trained regressor plus everything needed to reuse it safely.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub schema: FeatureSchema,
    pub regressor: FittedRegressor,
    /// The regressor predicts `ln(price)` when set.
    pub log_target: bool,
    pub cv_scores: Vec<CandidateScore>,
    pub run_id: String,
    pub trained_at: DateTime<Utc>,
    pub training_rows: usize,
    /// Digest of the training inputs (cleaned rows, embeddings, training
    /// configuration) the model was fitted on.
    #[serde(default)]
    pub inputs_digest: Option<String>,
}

impl ModelArtifact {
    pub fn kind(&self) -> ModelKind {
        self.schema.kind
    }

    pub fn best_cv_rmse(&self) -> Option<f64> {
        self.cv_scores
            .iter()
            .filter_map(|s| s.cv_rmse)
            .min_by(|a, b| a.total_cmp(b))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string(self)
            .with_context(|| format!("Failed to serialize {} model", self.kind()))?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model artifact {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed model artifact {}", path.display()))
    }
}
