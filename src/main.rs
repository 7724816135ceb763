// src/main.rs
use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use uuid::Uuid;

use valuation_lib::embedding::MissingImagePolicy;
use valuation_lib::models::artifact::ModelKind;
use valuation_lib::models::stats_models::StageOutcome;
use valuation_lib::pipeline::{
    run_all, run_evaluate, run_extract, run_fetch_images, run_gradcam, run_ingest, run_predict,
    run_train, PipelineContext,
};
use valuation_lib::utils::env::load_env;
use valuation_lib::utils::pipeline_config::PipelineConfig;
use valuation_lib::utils::progress_config::ProgressConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Per-invocation overrides of the environment configuration.
#[derive(Args)]
struct Overrides {
    /// Artifacts directory (VALUATION_ARTIFACT_DIR)
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    /// Tile cache directory (VALUATION_IMAGE_DIR)
    #[arg(long, global = true)]
    image_dir: Option<PathBuf>,

    /// Missing-image policy: exclude | zero-fill (VALUATION_MISSING_IMAGE_POLICY)
    #[arg(long, global = true)]
    missing_image_policy: Option<MissingImagePolicy>,

    /// Seed for the split and cross-validation folds (VALUATION_SEED)
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Recompute outputs that already exist, including cached tiles
    #[arg(long, global = true)]
    force: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Clean the raw dataset and split off the held-out set
    Ingest {
        #[arg(long)]
        input: PathBuf,
    },
    /// Download a satellite tile for every property
    FetchImages {
        /// Cap on network downloads for this run
        #[arg(long)]
        max_downloads: Option<usize>,
    },
    /// Embed every tile with the frozen backbone
    Extract,
    /// Train the tabular baseline
    TrainTabular,
    /// Train the image-only model
    TrainImage,
    /// Train the tabular + image fusion model
    TrainFusion,
    /// Write Grad-CAM overlays for the image model
    Gradcam {
        /// Property ids to explain (defaults to the first held-out properties)
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Score every model on the held-out split and write predictions.csv
    Evaluate {
        /// Model whose predictions are written (defaults to the lowest RMSE)
        #[arg(long)]
        model: Option<ModelKind>,
    },
    /// Score an external dataset with a trained model
    Predict {
        #[arg(long)]
        input: PathBuf,

        #[arg(long, default_value = "tabular")]
        model: ModelKind,

        #[arg(long, default_value = "predictions.csv")]
        output: PathBuf,
    },
    /// Run every stage in order
    Run {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        description: Option<String>,
    },
}

fn resolve_config(overrides: &Overrides) -> PipelineConfig {
    let mut config = PipelineConfig::from_env();
    if let Some(dir) = &overrides.artifact_dir {
        config.artifact_dir = dir.clone();
    }
    if let Some(dir) = &overrides.image_dir {
        config.image_dir = dir.clone();
    }
    if let Some(policy) = overrides.missing_image_policy {
        config.training.missing_image_policy = policy;
    }
    if let Some(seed) = overrides.seed {
        config.ingest.seed = seed;
        config.training.seed = seed;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();

    let mut config = resolve_config(&cli.overrides);
    if let Command::FetchImages {
        max_downloads: Some(cap),
    } = &cli.command
    {
        config.imagery.max_downloads = Some(*cap);
    }
    config.log_config();

    let progress = if cli.overrides.no_progress {
        ProgressConfig::disabled()
    } else {
        ProgressConfig::from_env()
    };
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress.enabled, progress.detailed
    );

    let run_id = Uuid::new_v4().to_string();
    info!("Run ID: {} ({})", run_id, Utc::now().to_rfc3339());
    let ctx = PipelineContext::new(config, progress, &run_id, cli.overrides.force);

    let outcome = match &cli.command {
        Command::Ingest { input } => run_ingest(&ctx, input)?,
        Command::FetchImages { .. } => run_fetch_images(&ctx).await?,
        Command::Extract => run_extract(&ctx)?,
        Command::TrainTabular => run_train(&ctx, ModelKind::Tabular)?,
        Command::TrainImage => run_train(&ctx, ModelKind::Image)?,
        Command::TrainFusion => run_train(&ctx, ModelKind::Fusion)?,
        Command::Gradcam { ids, limit } => run_gradcam(&ctx, ids, *limit)?,
        Command::Evaluate { model } => run_evaluate(&ctx, *model)?,
        Command::Predict {
            input,
            model,
            output,
        } => run_predict(&ctx, input, *model, output)?,
        Command::Run { input, description } => {
            let stats = run_all(&ctx, input, description.as_deref()).await?;
            let failed = stats.failed_stages();
            if !failed.is_empty() {
                return Err(anyhow!("Stages failed: {:?}", failed));
            }
            StageOutcome::Completed {
                seconds: stats.total_processing_time,
            }
        }
    };

    if let StageOutcome::Skipped { reason } = outcome {
        info!("Nothing to do ({}); pass --force to recompute", reason);
    }
    Ok(())
}
