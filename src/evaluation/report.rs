// src/evaluation/report.rs
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use super::metrics::{compute_metrics, RegressionMetrics};
use crate::embedding::{EmbeddingTable, MissingImagePolicy};
use crate::models::artifact::{ModelArtifact, ModelKind};
use crate::models::property::PropertyRecord;
use crate::models::property::TabularColumn;
use crate::training::{embedding_schema, predict_prices};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvaluation {
    pub kind: ModelKind,
    pub regressor: String,
    pub cv_rmse: Option<f64>,
    pub metrics: RegressionMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub run_id: String,
    pub evaluated_at: DateTime<Utc>,
    pub evaluation_rows: usize,
    /// Held-out properties left out of every model because of the exclude policy.
    pub excluded_ids: Vec<i64>,
    pub models: Vec<ModelEvaluation>,
    /// Models that could not be scored, with the reason.
    pub failed: BTreeMap<ModelKind, String>,
    pub best_model: ModelKind,
    pub predictions_model: ModelKind,
    /// `None` unless both the fusion and tabular models were evaluated.
    pub fusion_beats_tabular: Option<bool>,
}

impl EvaluationReport {
    pub fn metrics_for(&self, kind: ModelKind) -> Option<&RegressionMetrics> {
        self.models.iter().find(|m| m.kind == kind).map(|m| &m.metrics)
    }

    pub fn comparison_table(&self) -> String {
        let mut table = String::new();
        let _ = writeln!(
            table,
            "{:<8} {:>14} {:>14} {:>8} {:>6}  {}",
            "model", "RMSE", "MAE", "R2", "n", "regressor"
        );
        for m in &self.models {
            let marker = if m.kind == self.best_model { " *" } else { "" };
            let _ = writeln!(
                table,
                "{:<8} {:>14.0} {:>14.0} {:>8.4} {:>6}  {}{}",
                m.kind.as_str(),
                m.metrics.rmse,
                m.metrics.mae,
                m.metrics.r2,
                m.metrics.n,
                m.regressor,
                marker
            );
        }
        for (kind, reason) in &self.failed {
            let _ = writeln!(table, "{:<8} failed: {}", kind.as_str(), reason);
        }
        table
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize evaluation report")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Held-out rows every model is scored on. Under the exclude policy, rows
/// without an embedding are dropped for all models so the comparison is fair.
pub fn evaluation_split<'a>(
    holdout: &'a [PropertyRecord],
    artifacts: &BTreeMap<ModelKind, ModelArtifact>,
    embeddings: Option<&EmbeddingTable>,
) -> (Vec<&'a PropertyRecord>, Vec<i64>) {
    let excludes = artifacts.values().any(|a| {
        a.schema.embedding.is_some()
            && a.schema.missing_image_policy == Some(MissingImagePolicy::Exclude)
    });
    match embeddings {
        Some(table) if excludes => {
            let (kept, dropped): (Vec<_>, Vec<_>) = holdout
                .iter()
                .partition(|r| table.slot(r.id).is_present());
            (kept, dropped.into_iter().map(|r| r.id).collect())
        }
        _ => (holdout.iter().collect(), Vec::new()),
    }
}

/// Scores every artifact on the same evaluation rows. Returns the report and
/// the predictions of the requested model, or of the lowest-RMSE model.
///
/// An artifact whose schema does not match the held-out columns or the
/// embedding table is an error, not a failed entry. The predictions cover
/// every held-out row the chosen model can score, even when the exclude
/// policy shrank the shared metric split.
pub fn evaluate_models(
    artifacts: &BTreeMap<ModelKind, ModelArtifact>,
    holdout: &[PropertyRecord],
    embeddings: Option<&EmbeddingTable>,
    requested: Option<ModelKind>,
    run_id: &str,
) -> Result<(EvaluationReport, Vec<(i64, f64)>)> {
    if artifacts.is_empty() {
        return Err(anyhow!("No trained models to evaluate"));
    }
    let available = TabularColumn::available(holdout);
    let presented = embeddings.map(embedding_schema);
    for (kind, artifact) in artifacts {
        artifact
            .schema
            .check_inputs(&available, presented.as_ref())
            .with_context(|| format!("The {} model cannot score the held-out data", kind))?;
    }

    let (rows, excluded_ids) = evaluation_split(holdout, artifacts, embeddings);
    let rows: Vec<PropertyRecord> = rows.into_iter().cloned().collect();
    if rows.is_empty() {
        return Err(anyhow!("Evaluation split is empty"));
    }
    let actual: HashMap<i64, f64> = rows
        .iter()
        .map(|r| {
            r.price
                .map(|p| (r.id, p))
                .ok_or_else(|| anyhow!("Held-out property {} has no price", r.id))
        })
        .collect::<Result<_>>()?;

    let mut models = Vec::new();
    let mut failed = BTreeMap::new();
    let mut all_predictions: BTreeMap<ModelKind, Vec<(i64, f64)>> = BTreeMap::new();
    for (kind, artifact) in artifacts {
        let scored = predict_prices(artifact, &rows, embeddings).and_then(|predictions| {
            if predictions.len() != rows.len() {
                return Err(anyhow!(
                    "scored {} of {} evaluation rows",
                    predictions.len(),
                    rows.len()
                ));
            }
            let truth: Vec<f64> = predictions.iter().map(|(id, _)| actual[id]).collect();
            let predicted: Vec<f64> = predictions.iter().map(|(_, p)| *p).collect();
            Ok((compute_metrics(&truth, &predicted)?, predictions))
        });
        match scored {
            Ok((metrics, predictions)) => {
                models.push(ModelEvaluation {
                    kind: *kind,
                    regressor: artifact.regressor.describe(),
                    cv_rmse: artifact.best_cv_rmse(),
                    metrics,
                });
                all_predictions.insert(*kind, predictions);
            }
            Err(e) => {
                warn!("Could not evaluate the {} model: {:#}", kind, e);
                failed.insert(*kind, format!("{:#}", e));
            }
        }
    }

    let best_model = models
        .iter()
        .min_by(|a, b| a.metrics.rmse.total_cmp(&b.metrics.rmse))
        .map(|m| m.kind)
        .ok_or_else(|| anyhow!("No model could be evaluated"))?;
    let predictions_model = requested.unwrap_or(best_model);
    let mut predictions = all_predictions.remove(&predictions_model).ok_or_else(|| {
        anyhow!(
            "Requested {} model was not evaluated successfully",
            predictions_model
        )
    })?;
    if !excluded_ids.is_empty() {
        if let Some(artifact) = artifacts.get(&predictions_model) {
            predictions = predict_prices(artifact, holdout, embeddings).with_context(|| {
                format!("Failed to score the full held-out set with the {} model", predictions_model)
            })?;
        }
    }

    let rmse = |kind: ModelKind| {
        models
            .iter()
            .find(|m| m.kind == kind)
            .map(|m| m.metrics.rmse)
    };
    let fusion_beats_tabular = match (rmse(ModelKind::Fusion), rmse(ModelKind::Tabular)) {
        (Some(fusion), Some(tabular)) => Some(fusion < tabular),
        _ => None,
    };

    Ok((
        EvaluationReport {
            run_id: run_id.to_string(),
            evaluated_at: Utc::now(),
            evaluation_rows: rows.len(),
            excluded_ids,
            models,
            failed,
            best_model,
            predictions_model,
            fusion_beats_tabular,
        },
        predictions,
    ))
}
