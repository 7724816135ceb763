// src/pipeline/run.rs
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{error, info};
use std::path::Path;
use std::time::Instant;

use super::stages::{
    run_evaluate, run_extract, run_fetch_images, run_gradcam, run_ingest, run_train,
};
use super::PipelineContext;
use crate::models::artifact::ModelKind;
use crate::models::stats_models::{PipelineStage, PipelineStats, StageOutcome};
use crate::utils::get_memory_usage;
use crate::utils::instantiate_run::{create_initial_pipeline_run, save_pipeline_run};
use crate::utils::logging::StageLogger;

const GRADCAM_SAMPLES: usize = 5;
const TOTAL_STAGES: u64 = 8;

/// Records a stage result in the run record. Returns whether the stage succeeded.
fn record_outcome(
    stats: &mut PipelineStats,
    stage: PipelineStage,
    result: Result<StageOutcome>,
) -> bool {
    let outcome = result.unwrap_or_else(|e| {
        StageLogger::new(stage).log_error(&format!("Stage failed: {:#}", e));
        StageOutcome::Failed {
            error: format!("{:#}", e),
        }
    });
    let ok = !matches!(outcome, StageOutcome::Failed { .. });
    stats.stages.insert(stage, outcome);
    ok
}

/// Runs every stage in order. Ingestion failure aborts the run; any other
/// failure is recorded and the remaining stages still run, so e.g. the tabular
/// model is trained and evaluated even when imagery is unavailable.
pub async fn run_all(
    ctx: &PipelineContext,
    input: &Path,
    description: Option<&str>,
) -> Result<PipelineStats> {
    let start = Instant::now();
    let mut stats =
        create_initial_pipeline_run(ctx.paths.root(), &ctx.run_id, Utc::now(), description)?;
    let main_pb = ctx.progress.main_bar(ctx.multi_progress.as_ref(), TOTAL_STAGES);

    let set_message = |phase: &str| {
        let phase = phase.to_string();
        let pb = main_pb.clone();
        let show_memory = ctx.progress.should_show_memory();
        async move {
            if let Some(pb) = pb {
                if show_memory {
                    let memory_mb = get_memory_usage().await;
                    pb.set_message(format!("{} (Memory: {} MB)", phase, memory_mb));
                } else {
                    pb.set_message(phase);
                }
            }
        }
    };
    let advance = || {
        if let Some(pb) = &main_pb {
            pb.inc(1);
        }
    };

    set_message("Ingesting dataset").await;
    if !record_outcome(&mut stats, PipelineStage::Ingest, run_ingest(ctx, input)) {
        stats.total_processing_time = start.elapsed().as_secs_f64();
        save_pipeline_run(ctx.paths.root(), &stats)?;
        return Err(anyhow!("Ingestion failed; nothing else can run"));
    }
    advance();

    set_message("Fetching satellite tiles").await;
    record_outcome(
        &mut stats,
        PipelineStage::FetchImages,
        run_fetch_images(ctx).await,
    );
    advance();

    set_message("Extracting embeddings").await;
    record_outcome(&mut stats, PipelineStage::Extract, run_extract(ctx));
    advance();

    for (kind, stage) in [
        (ModelKind::Tabular, PipelineStage::TrainTabular),
        (ModelKind::Image, PipelineStage::TrainImage),
        (ModelKind::Fusion, PipelineStage::TrainFusion),
    ] {
        set_message(&format!("Training {} model", kind)).await;
        record_outcome(&mut stats, stage, run_train(ctx, kind));
        advance();
    }

    set_message("Grad-CAM").await;
    let gradcam = if ctx.paths.model(ModelKind::Image).exists() {
        run_gradcam(ctx, &[], GRADCAM_SAMPLES)
    } else {
        Ok(StageOutcome::Skipped {
            reason: "no image model".to_string(),
        })
    };
    record_outcome(&mut stats, PipelineStage::GradCam, gradcam);
    advance();

    set_message("Evaluating").await;
    record_outcome(&mut stats, PipelineStage::Evaluate, run_evaluate(ctx, None));
    advance();

    stats.total_processing_time = start.elapsed().as_secs_f64();
    let record_path = save_pipeline_run(ctx.paths.root(), &stats)?;
    if let Some(pb) = &main_pb {
        pb.finish_with_message("Pipeline complete");
    }

    let failed = stats.failed_stages();
    if failed.is_empty() {
        info!(
            "Pipeline run {} finished in {:.1}s (record: {})",
            stats.run_id,
            stats.total_processing_time,
            record_path.display()
        );
    } else {
        error!(
            "Pipeline run {} finished with failed stages: {:?} (record: {})",
            stats.run_id,
            failed,
            record_path.display()
        );
    }
    Ok(stats)
}
