// src/pipeline/stages.rs
use anyhow::{anyhow, Context, Result};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::PipelineContext;
use crate::embedding::{extract_embeddings, shared_backbone, EmbeddingTable};
use crate::evaluation::{evaluate_models, write_predictions};
use crate::imagery::{acquire_images, ImageManifest, MapboxClient, TileCache, TileProvider};
use crate::ingestion::{
    parse_csv_file, read_records, split_holdout, write_records, ParsedDataset, Preprocessing,
};
use crate::interpretation::gradcam::{grad_cam, render_overlay, save_overlay};
use crate::models::artifact::{ModelArtifact, ModelKind};
use crate::models::property::PropertyRecord;
use crate::models::stats_models::{IngestReport, PipelineStage, StageOutcome};
use crate::training::{predict_prices, train_model};
use crate::utils::file_digest;
use crate::utils::logging::StageLogger;

const GRADCAM_OPACITY: f32 = 0.45;

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Malformed {}", path.display()))
}

fn all_exist(paths: &[PathBuf]) -> bool {
    paths.iter().all(|p| p.exists())
}

fn skipped(logger: &StageLogger, reason: &str) -> StageOutcome {
    logger.log_skipped(reason);
    StageOutcome::Skipped {
        reason: reason.to_string(),
    }
}

fn completed(logger: &StageLogger, summary: &str) -> StageOutcome {
    logger.log_completion(summary);
    StageOutcome::Completed {
        seconds: logger.elapsed_secs(),
    }
}

/// Training and held-out records written by the ingest stage.
fn load_cleaned(ctx: &PipelineContext) -> Result<(Vec<PropertyRecord>, Vec<PropertyRecord>)> {
    let train = read_records(&ctx.paths.train())
        .context("Cleaned training data not found; run the ingest stage first")?;
    let holdout = read_records(&ctx.paths.holdout())
        .context("Held-out data not found; run the ingest stage first")?;
    Ok((train, holdout))
}

fn load_embeddings(ctx: &PipelineContext) -> Result<EmbeddingTable> {
    EmbeddingTable::load(&ctx.paths.embeddings())
        .context("Embedding table not found; run the extract stage first")
}

fn load_model(ctx: &PipelineContext, kind: ModelKind) -> Result<ModelArtifact> {
    ModelArtifact::load(&ctx.paths.model(kind))
        .with_context(|| format!("No trained {} model; run train-{} first", kind, kind))
}

pub fn run_ingest(ctx: &PipelineContext, input: &Path) -> Result<StageOutcome> {
    let logger = StageLogger::new(PipelineStage::Ingest);
    logger.log_start(&ctx.run_id);
    let digest = file_digest(input)?;
    let outputs = [
        ctx.paths.train(),
        ctx.paths.holdout(),
        ctx.paths.ingest_report(),
        ctx.paths.preprocessing(),
    ];
    if !ctx.force && all_exist(&outputs) {
        match read_json::<IngestReport>(&ctx.paths.ingest_report()) {
            Ok(previous) if previous.source_digest.as_deref() == Some(digest.as_str()) => {
                return Ok(skipped(&logger, "cleaned dataset for this input already exists"));
            }
            Ok(_) => logger.log_warning("input differs from the last ingest; cleaning again"),
            Err(e) => logger.log_warning(&format!("{:#}; cleaning again", e)),
        }
    }

    logger.log_phase("Parsing", Some(&input.display().to_string()));
    let ParsedDataset { rows, mut report } = parse_csv_file(input, &ctx.config.ingest, true)?;

    logger.log_phase("Splitting", None);
    let (train_rows, holdout_rows) = split_holdout(
        rows,
        ctx.config.ingest.holdout_fraction,
        ctx.config.ingest.seed,
    );
    if train_rows.is_empty() {
        return Err(anyhow!(
            "Held-out fraction {} leaves no training rows",
            ctx.config.ingest.holdout_fraction
        ));
    }

    // Fences and medians come from the training rows only.
    logger.log_phase("Fitting preprocessing", Some("on the training split"));
    let preprocessing = Preprocessing::fit(&train_rows, &ctx.config.ingest)?;
    let train = preprocessing.apply(train_rows, true, &mut report)?;
    let holdout = preprocessing.apply(holdout_rows, true, &mut report)?;
    report.train_rows = train.len();
    report.holdout_rows = holdout.len();
    report.source_path = Some(input.display().to_string());
    report.source_digest = Some(digest);

    write_records(&ctx.paths.train(), &train)?;
    write_records(&ctx.paths.holdout(), &holdout)?;
    preprocessing.save(&ctx.paths.preprocessing())?;
    write_json(&ctx.paths.ingest_report(), &report)?;
    logger.log_ingest_report(&report);

    Ok(completed(
        &logger,
        &format!("{} training and {} held-out properties", train.len(), holdout.len()),
    ))
}

/// Fetches tiles from Mapbox. The token is only required when something
/// actually needs downloading.
pub async fn run_fetch_images(ctx: &PipelineContext) -> Result<StageOutcome> {
    let imagery = &ctx.config.imagery;
    fetch_stage(ctx, || {
        MapboxClient::from_env(&imagery.base_url, imagery.request_timeout)
    })
    .await
}

pub async fn run_fetch_images_with<P: TileProvider>(
    ctx: &PipelineContext,
    provider: P,
) -> Result<StageOutcome> {
    fetch_stage(ctx, || Ok(provider)).await
}

async fn fetch_stage<P, F>(ctx: &PipelineContext, make_provider: F) -> Result<StageOutcome>
where
    P: TileProvider,
    F: FnOnce() -> Result<P>,
{
    let logger = StageLogger::new(PipelineStage::FetchImages);
    logger.log_start(&ctx.run_id);

    let (train, holdout) = load_cleaned(ctx)?;
    let records: Vec<PropertyRecord> = train.into_iter().chain(holdout).collect();
    logger.log_data_loaded(records.len(), "properties");

    if !ctx.force {
        if let Ok(manifest) = ImageManifest::load(&ctx.paths.image_manifest()) {
            // Missing entries are retried on the next pass, e.g. after a download cap.
            let complete = manifest.tile == ctx.config.imagery.tile
                && records.iter().all(|r| {
                    manifest
                        .entries
                        .get(&r.id)
                        .is_some_and(|e| e.is_available() && e.path.exists())
                });
            if complete {
                return Ok(skipped(&logger, "every property already has a tile on disk"));
            }
        }
    }

    let provider = make_provider()?;
    let cache = TileCache::new(&ctx.config.image_dir);
    let bar = ctx.progress.stage_bar(
        ctx.multi_progress.as_ref(),
        records.len() as u64,
        "Fetching satellite tiles",
    );

    logger.log_phase(
        "Acquiring tiles",
        Some(&format!("into {}", ctx.config.image_dir.display())),
    );
    let (manifest, stats) = acquire_images(
        &provider,
        &cache,
        &records,
        &ctx.config.imagery,
        ctx.force,
        bar,
    )
    .await?;
    manifest.save(&ctx.paths.image_manifest())?;
    logger.log_acquisition(&stats);
    if ctx.progress.should_show_cache_stats() {
        logger.log_cache_stats(&stats);
    }

    Ok(StageOutcome::Completed {
        seconds: logger.elapsed_secs(),
    })
}

pub fn run_extract(ctx: &PipelineContext) -> Result<StageOutcome> {
    let logger = StageLogger::new(PipelineStage::Extract);
    logger.log_start(&ctx.run_id);

    let backbone = shared_backbone(&ctx.config.backbone)?;
    let manifest_path = ctx.paths.image_manifest();
    let manifest = ImageManifest::load(&manifest_path)
        .context("Image manifest not found; run the fetch-images stage first")?;
    let manifest_digest = file_digest(&manifest_path)?;
    if !ctx.force {
        if let Ok(existing) = EmbeddingTable::load(&ctx.paths.embeddings()) {
            if existing.backbone_fingerprint != backbone.fingerprint() {
                logger.log_warning("existing embeddings came from a different backbone; recomputing");
            } else if existing.manifest_digest.as_deref() == Some(manifest_digest.as_str()) {
                return Ok(skipped(&logger, "embeddings for these tiles and backbone already exist"));
            } else {
                logger.log_warning("image manifest changed since the last extraction; recomputing");
            }
        }
    }

    let (train, holdout) = load_cleaned(ctx)?;
    let records: Vec<PropertyRecord> = train.into_iter().chain(holdout).collect();
    logger.log_data_loaded(manifest.available_count(), "tiles");
    logger.log_debug(&format!("backbone fingerprint {}", backbone.fingerprint()));

    let bar = ctx.progress.stage_bar(
        ctx.multi_progress.as_ref(),
        records.len() as u64,
        "Extracting embeddings",
    );
    let (mut table, stats) = extract_embeddings(&backbone, &records, &manifest, bar)?;
    table.manifest_digest = Some(manifest_digest);
    logger.log_data_quality_issue("properties without a tile", stats.missing);
    logger.log_data_quality_issue("unreadable tiles", stats.unreadable);
    table.save(&ctx.paths.embeddings())?;

    Ok(completed(
        &logger,
        &format!("{} embeddings of dimension {}", stats.embedded, table.dim),
    ))
}

pub fn run_train(ctx: &PipelineContext, kind: ModelKind) -> Result<StageOutcome> {
    let stage = match kind {
        ModelKind::Tabular => PipelineStage::TrainTabular,
        ModelKind::Image => PipelineStage::TrainImage,
        ModelKind::Fusion => PipelineStage::TrainFusion,
    };
    let logger = StageLogger::new(stage);
    logger.log_start(&ctx.run_id);
    let output = ctx.paths.model(kind);
    let digest = training_inputs_digest(ctx, kind)?;
    if !ctx.force && output.exists() {
        match ModelArtifact::load(&output) {
            Ok(existing) if existing.inputs_digest.as_deref() == Some(digest.as_str()) => {
                return Ok(skipped(
                    &logger,
                    &format!("{} is up to date with its inputs", output.display()),
                ));
            }
            Ok(_) => logger.log_warning("training inputs changed since the last fit; retraining"),
            Err(e) => logger.log_warning(&format!("{:#}; retraining", e)),
        }
    }

    let (train, _) = load_cleaned(ctx)?;
    logger.log_data_loaded(train.len(), "training properties");
    let embeddings = if kind.uses_images() {
        Some(load_embeddings(ctx)?)
    } else {
        None
    };

    let bar = ctx
        .progress
        .stage_bar(ctx.multi_progress.as_ref(), 1, &format!("Training {} model", kind));
    let mut artifact = train_model(
        kind,
        &train,
        embeddings.as_ref(),
        &ctx.config.training,
        &ctx.run_id,
        bar.as_ref(),
    )?;
    if let Some(pb) = &bar {
        pb.finish_and_clear();
    }
    artifact.inputs_digest = Some(digest);
    artifact.save(&output)?;

    let cv = artifact
        .best_cv_rmse()
        .map(|r| format!("{:.4}", r))
        .unwrap_or_else(|| "n/a".to_string());
    Ok(completed(
        &logger,
        &format!(
            "{} on {} rows, CV RMSE {}",
            artifact.regressor.describe(),
            artifact.training_rows,
            cv
        ),
    ))
}

/// SHA-256 over everything a fit depends on: the training split, the
/// embedding table for image-consuming models, and the training settings.
fn training_inputs_digest(ctx: &PipelineContext, kind: ModelKind) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(
        file_digest(&ctx.paths.train())
            .context("Cleaned training data not found; run the ingest stage first")?,
    );
    if kind.uses_images() {
        hasher.update(
            file_digest(&ctx.paths.embeddings())
                .context("Embedding table not found; run the extract stage first")?,
        );
    }
    hasher.update(format!("{:?}", ctx.config.training));
    Ok(hex::encode(hasher.finalize()))
}

/// Writes Grad-CAM overlays for `ids`, or for the first `limit` held-out
/// properties that have a tile when `ids` is empty.
pub fn run_gradcam(ctx: &PipelineContext, ids: &[i64], limit: usize) -> Result<StageOutcome> {
    let logger = StageLogger::new(PipelineStage::GradCam);
    logger.log_start(&ctx.run_id);

    let artifact = load_model(ctx, ModelKind::Image)?;
    let backbone = shared_backbone(&ctx.config.backbone)?;
    let manifest = ImageManifest::load(&ctx.paths.image_manifest())
        .context("Image manifest not found; run the fetch-images stage first")?;

    let targets: Vec<i64> = if ids.is_empty() {
        let (_, holdout) = load_cleaned(ctx)?;
        holdout
            .iter()
            .map(|r| r.id)
            .filter(|id| manifest.image_for(*id).is_some())
            .take(limit)
            .collect()
    } else {
        ids.to_vec()
    };
    if targets.is_empty() {
        return Ok(skipped(&logger, "no properties with a tile to explain"));
    }

    let out_dir = ctx.paths.gradcam_dir();
    let mut written = 0;
    for id in &targets {
        let Some(tile) = manifest.image_for(*id) else {
            logger.log_warning(&format!("property {} has no tile; skipping", id));
            continue;
        };
        let bytes = fs::read(tile).with_context(|| format!("Failed to read {}", tile.display()))?;
        let map = grad_cam(&backbone, &artifact, &bytes)?;
        let overlay = render_overlay(&bytes, &map, GRADCAM_OPACITY)?;
        let path = out_dir.join(format!("{}.png", id));
        save_overlay(&path, &overlay)?;
        logger.log_debug(&format!(
            "property {}: predicted {:.0}, map {}",
            id,
            map.predicted_price,
            path.display()
        ));
        written += 1;
    }

    Ok(completed(
        &logger,
        &format!("{} saliency maps in {}", written, out_dir.display()),
    ))
}

pub fn run_evaluate(ctx: &PipelineContext, requested: Option<ModelKind>) -> Result<StageOutcome> {
    let logger = StageLogger::new(PipelineStage::Evaluate);
    logger.log_start(&ctx.run_id);

    let (_, holdout) = load_cleaned(ctx)?;
    let mut artifacts = BTreeMap::new();
    for kind in ModelKind::ALL {
        if ctx.paths.model(kind).exists() {
            artifacts.insert(kind, load_model(ctx, kind)?);
        } else {
            logger.log_warning(&format!("no {} model to evaluate", kind));
        }
    }
    if artifacts.is_empty() {
        return Err(anyhow!("No trained models found in {}", ctx.paths.root().display()));
    }
    let embeddings = if artifacts.values().any(|a| a.schema.embedding.is_some()) {
        Some(load_embeddings(ctx)?)
    } else {
        None
    };

    let (report, predictions) = evaluate_models(
        &artifacts,
        &holdout,
        embeddings.as_ref(),
        requested,
        &ctx.run_id,
    )?;
    if !report.excluded_ids.is_empty() {
        logger.log_warning(&format!(
            "{} held-out properties without an image excluded from every model",
            report.excluded_ids.len()
        ));
    }
    for line in report.comparison_table().lines() {
        info!("    {}", line);
    }
    match report.fusion_beats_tabular {
        Some(true) => info!("Fusion model beat the tabular baseline"),
        Some(false) => info!("Fusion model did NOT beat the tabular baseline"),
        None => {}
    }

    report.save(&ctx.paths.metrics())?;
    write_predictions(&ctx.paths.predictions(), &predictions)?;

    Ok(completed(
        &logger,
        &format!(
            "{} predictions from the {} model written to {}",
            predictions.len(),
            report.predictions_model,
            ctx.paths.predictions().display()
        ),
    ))
}

/// Scores an external, possibly unlabelled CSV with a trained model.
pub fn run_predict(
    ctx: &PipelineContext,
    input: &Path,
    kind: ModelKind,
    output: &Path,
) -> Result<StageOutcome> {
    let logger = StageLogger::new(PipelineStage::Predict);
    logger.log_start(&ctx.run_id);

    let preprocessing = Preprocessing::load(&ctx.paths.preprocessing())
        .context("No fitted preprocessing; run the ingest stage first")?;
    let ParsedDataset { rows, mut report } = parse_csv_file(input, &ctx.config.ingest, false)?;
    // Never drop rows someone asked to have scored.
    let records = preprocessing.apply(rows, false, &mut report)?;
    logger.log_ingest_report(&report);

    let artifact = load_model(ctx, kind)?;
    let embeddings = if artifact.schema.embedding.is_some() {
        Some(load_embeddings(ctx)?)
    } else {
        None
    };
    let predictions = predict_prices(&artifact, &records, embeddings.as_ref())?;
    let unscored = records.len() - predictions.len();
    logger.log_data_quality_issue("properties without an image left unscored", unscored);

    write_predictions(output, &predictions)?;
    Ok(completed(
        &logger,
        &format!("{} predictions written to {}", predictions.len(), output.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::BackboneArch;
    use crate::imagery::{FetchError, TileRequest};
    use crate::testing::{png_bytes, synthetic_records};
    use crate::utils::pipeline_config::PipelineConfig;
    use crate::utils::progress_config::ProgressConfig;
    use bytes::Bytes;
    use std::time::Duration;

    struct PngProvider;

    impl TileProvider for PngProvider {
        async fn fetch(&self, request: &TileRequest) -> Result<Bytes, FetchError> {
            let seed = ((request.lat * 1000.0).round() as i64).rem_euclid(251) as u8;
            Ok(Bytes::from(png_bytes(seed)))
        }
    }

    fn context(root: &Path) -> PipelineContext {
        let mut config = PipelineConfig {
            artifact_dir: root.join("artifacts"),
            image_dir: root.join("images"),
            ..Default::default()
        };
        config.imagery.request_delay = Duration::ZERO;
        config.backbone.arch = BackboneArch::Compact;
        config.backbone.input_size = Some(32);
        config.training.cv_folds = 3;
        config.training.forest_trees = 10;
        config.training.forest_max_depth = 6;
        PipelineContext::new(config, ProgressConfig::disabled(), "test-run", false)
    }

    #[tokio::test]
    async fn test_stages_chain_through_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.csv");
        write_records(&input, &synthetic_records(50, 4)).unwrap();
        let ctx = context(dir.path());

        assert!(matches!(
            run_ingest(&ctx, &input).unwrap(),
            StageOutcome::Completed { .. }
        ));
        assert!(matches!(
            run_ingest(&ctx, &input).unwrap(),
            StageOutcome::Skipped { .. }
        ));

        assert!(matches!(
            run_fetch_images_with(&ctx, PngProvider).await.unwrap(),
            StageOutcome::Completed { .. }
        ));
        assert!(matches!(
            run_fetch_images_with(&ctx, PngProvider).await.unwrap(),
            StageOutcome::Skipped { .. }
        ));

        run_extract(&ctx).unwrap();
        for kind in ModelKind::ALL {
            assert!(matches!(
                run_train(&ctx, kind).unwrap(),
                StageOutcome::Completed { .. }
            ));
        }

        run_gradcam(&ctx, &[], 2).unwrap();
        assert_eq!(fs::read_dir(ctx.paths.gradcam_dir()).unwrap().count(), 2);

        run_evaluate(&ctx, None).unwrap();
        let holdout = read_records(&ctx.paths.holdout()).unwrap();
        let predictions = fs::read_to_string(ctx.paths.predictions()).unwrap();
        assert_eq!(predictions.lines().count(), holdout.len() + 1);
        assert!(ctx.paths.metrics().exists());

        let output = dir.path().join("scored.csv");
        run_predict(&ctx, &input, ModelKind::Tabular, &output).unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap().lines().count(), 51);
    }

    #[test]
    fn test_training_without_embeddings_points_at_extract() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.csv");
        write_records(&input, &synthetic_records(30, 1)).unwrap();
        let ctx = context(dir.path());
        run_ingest(&ctx, &input).unwrap();

        let err = run_train(&ctx, ModelKind::Fusion).unwrap_err();
        assert!(format!("{:#}", err).contains("run the extract stage first"));
        assert!(run_train(&ctx, ModelKind::Tabular).is_ok());
    }

    #[tokio::test]
    async fn test_capped_fetch_resumes_where_it_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.csv");
        write_records(&input, &synthetic_records(10, 9)).unwrap();
        let mut ctx = context(dir.path());
        ctx.config.ingest.outliers = None;
        ctx.config.imagery.max_downloads = Some(3);
        run_ingest(&ctx, &input).unwrap();

        let available = || {
            ImageManifest::load(&ctx.paths.image_manifest())
                .unwrap()
                .available_count()
        };
        for expected in [3, 6, 9, 10] {
            assert!(matches!(
                run_fetch_images_with(&ctx, PngProvider).await.unwrap(),
                StageOutcome::Completed { .. }
            ));
            assert_eq!(available(), expected);
        }
        assert!(matches!(
            run_fetch_images_with(&ctx, PngProvider).await.unwrap(),
            StageOutcome::Skipped { .. }
        ));

        // A lost tile is fetched again instead of trusting the manifest.
        let manifest = ImageManifest::load(&ctx.paths.image_manifest()).unwrap();
        fs::remove_file(manifest.image_for(1).unwrap()).unwrap();
        assert!(matches!(
            run_fetch_images_with(&ctx, PngProvider).await.unwrap(),
            StageOutcome::Completed { .. }
        ));

        assert!(matches!(run_extract(&ctx).unwrap(), StageOutcome::Completed { .. }));
        assert!(matches!(run_extract(&ctx).unwrap(), StageOutcome::Skipped { .. }));
    }

    #[test]
    fn test_changed_input_invalidates_ingest_and_training() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.csv");
        write_records(&input, &synthetic_records(30, 1)).unwrap();
        let ctx = context(dir.path());

        run_ingest(&ctx, &input).unwrap();
        let report: IngestReport = read_json(&ctx.paths.ingest_report()).unwrap();
        assert_eq!(report.source_path.as_deref(), Some(input.display().to_string().as_str()));
        assert_eq!(report.source_digest, Some(file_digest(&input).unwrap()));
        assert!(matches!(
            run_train(&ctx, ModelKind::Tabular).unwrap(),
            StageOutcome::Completed { .. }
        ));
        assert!(matches!(
            run_train(&ctx, ModelKind::Tabular).unwrap(),
            StageOutcome::Skipped { .. }
        ));

        write_records(&input, &synthetic_records(40, 2)).unwrap();
        assert!(matches!(
            run_ingest(&ctx, &input).unwrap(),
            StageOutcome::Completed { .. }
        ));
        assert!(matches!(
            run_train(&ctx, ModelKind::Tabular).unwrap(),
            StageOutcome::Completed { .. }
        ));
        let artifact = ModelArtifact::load(&ctx.paths.model(ModelKind::Tabular)).unwrap();
        assert_eq!(artifact.training_rows, read_records(&ctx.paths.train()).unwrap().len());

        let mut retuned = context(dir.path());
        retuned.config.training.cv_folds = 4;
        assert!(matches!(
            run_train(&retuned, ModelKind::Tabular).unwrap(),
            StageOutcome::Completed { .. }
        ));
    }
}
