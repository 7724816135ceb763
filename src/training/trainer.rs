// src/training/trainer.rs
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use indicatif::ProgressBar;
use log::{info, warn};

use super::features::{build_design, build_schema, targets, to_price};
use crate::embedding::EmbeddingTable;
use crate::models::artifact::{ModelArtifact, ModelKind};
use crate::models::property::PropertyRecord;
use crate::regression::{select_and_fit, Candidate};
use crate::utils::pipeline_config::TrainingConfig;

/// Candidate family for a model kind. The image head is ridge-only.
pub fn candidates_for(kind: ModelKind, config: &TrainingConfig) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = config
        .ridge_alphas
        .iter()
        .map(|&alpha| Candidate::Ridge { alpha })
        .collect();
    if kind != ModelKind::Image && config.forest_trees > 0 {
        candidates.push(Candidate::Forest {
            n_trees: config.forest_trees,
            max_depth: config.forest_max_depth,
        });
    }
    candidates
}

/// Fits one model kind on labelled records, choosing the candidate with the
/// lowest cross-validated RMSE.
pub fn train_model(
    kind: ModelKind,
    records: &[PropertyRecord],
    embeddings: Option<&EmbeddingTable>,
    config: &TrainingConfig,
    run_id: &str,
    progress: Option<&ProgressBar>,
) -> Result<ModelArtifact> {
    let schema = build_schema(kind, records, embeddings, config.missing_image_policy)?;
    let design = build_design(&schema, records, embeddings)?;
    if !design.excluded.is_empty() {
        warn!(
            "{} model: {} training properties without an image excluded",
            kind,
            design.excluded.len()
        );
    }
    let y = targets(&design.prices, config.log_target)
        .with_context(|| format!("{} model needs a positive price on every training row", kind))?;

    let candidates = candidates_for(kind, config);
    if candidates.is_empty() {
        return Err(anyhow!("No candidate regressors configured for the {} model", kind));
    }
    if let Some(pb) = progress {
        pb.set_length(candidates.len() as u64);
    }
    info!(
        "Training {} model on {} rows x {} features ({} candidates)",
        kind,
        design.len(),
        schema.width(),
        candidates.len()
    );

    let (regressor, cv_scores) = select_and_fit(
        &design.x,
        &y,
        &candidates,
        config.cv_folds,
        config.seed,
        progress,
    )
    .with_context(|| format!("Training the {} model failed", kind))?;
    info!("{} model selected {}", kind, regressor.describe());

    Ok(ModelArtifact {
        schema,
        regressor,
        log_target: config.log_target,
        cv_scores,
        run_id: run_id.to_string(),
        trained_at: Utc::now(),
        training_rows: design.len(),
        inputs_digest: None,
    })
}

/// Scores records with a trained model. Records excluded by the model's
/// missing-image policy get no prediction.
pub fn predict_prices(
    artifact: &ModelArtifact,
    records: &[PropertyRecord],
    embeddings: Option<&EmbeddingTable>,
) -> Result<Vec<(i64, f64)>> {
    let design = build_design(&artifact.schema, records, embeddings)?;
    if design.is_empty() {
        return Ok(Vec::new());
    }
    let raw = artifact
        .regressor
        .predict(&design.x)
        .with_context(|| format!("{} model failed to predict", artifact.kind()))?;
    Ok(design
        .ids
        .into_iter()
        .zip(raw)
        .map(|(id, p)| (id, to_price(p, artifact.log_target)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MissingImagePolicy;
    use crate::testing::synthetic_records;

    fn quick_config() -> TrainingConfig {
        TrainingConfig {
            cv_folds: 3,
            forest_trees: 10,
            forest_max_depth: 6,
            ..Default::default()
        }
    }

    fn noise_table(records: &[PropertyRecord]) -> EmbeddingTable {
        let mut table = EmbeddingTable::new("fp", 4);
        for r in records {
            let h = (r.id as f32 * 12.9898).sin() * 43758.547;
            table
                .entries
                .insert(r.id, (0..4).map(|k| (h * (k as f32 + 1.0)).fract()).collect());
        }
        table
    }

    #[test]
    fn test_saved_artifact_predicts_identically() {
        let records = synthetic_records(40, 5);
        let table = noise_table(&records);
        let artifact = train_model(
            ModelKind::Fusion,
            &records,
            Some(&table),
            &quick_config(),
            "run",
            None,
        )
        .unwrap();
        assert_eq!(artifact.cv_scores.len(), 5);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ModelKind::Fusion.artifact_file_name());
        artifact.save(&path).unwrap();
        let reloaded = ModelArtifact::load(&path).unwrap();

        assert_eq!(reloaded.schema, artifact.schema);
        assert_eq!(
            predict_prices(&reloaded, &records, Some(&table)).unwrap(),
            predict_prices(&artifact, &records, Some(&table)).unwrap()
        );
    }

    #[test]
    fn test_image_model_excludes_missing_under_exclude_policy() {
        let records = synthetic_records(30, 2);
        let mut table = noise_table(&records);
        table.entries.remove(&1);
        let config = TrainingConfig {
            missing_image_policy: MissingImagePolicy::Exclude,
            ..quick_config()
        };
        let artifact =
            train_model(ModelKind::Image, &records, Some(&table), &config, "run", None).unwrap();
        assert_eq!(artifact.training_rows, 29);
        assert!(artifact
            .cv_scores
            .iter()
            .all(|s| matches!(s.candidate, Candidate::Ridge { .. })));

        let predictions = predict_prices(&artifact, &records, Some(&table)).unwrap();
        assert_eq!(predictions.len(), 29);
        assert!(predictions.iter().all(|(id, _)| *id != 1));
    }

    #[test]
    fn test_image_model_requires_embeddings() {
        let records = synthetic_records(10, 2);
        assert!(train_model(ModelKind::Image, &records, None, &quick_config(), "run", None).is_err());
    }
}
