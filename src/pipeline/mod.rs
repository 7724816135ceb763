//! Independently invocable stages that communicate only through files in the
//! artifacts directory, plus the `run` orchestration over all of them.

pub mod run;
pub mod stages;

use indicatif::MultiProgress;
use std::path::{Path, PathBuf};

use crate::models::artifact::ModelKind;
use crate::utils::pipeline_config::PipelineConfig;
use crate::utils::progress_config::ProgressConfig;

pub use run::run_all;
pub use stages::{
    run_evaluate, run_extract, run_fetch_images, run_fetch_images_with, run_gradcam, run_ingest,
    run_predict, run_train,
};

/// Well-known file locations under the artifacts directory.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    root: PathBuf,
}

impl ArtifactPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn train(&self) -> PathBuf {
        self.root.join("train.csv")
    }

    pub fn holdout(&self) -> PathBuf {
        self.root.join("holdout.csv")
    }

    pub fn ingest_report(&self) -> PathBuf {
        self.root.join("ingest_report.json")
    }

    /// Outlier fences and imputation medians fitted on the training split.
    pub fn preprocessing(&self) -> PathBuf {
        self.root.join("preprocessing.json")
    }

    pub fn image_manifest(&self) -> PathBuf {
        self.root.join("image_manifest.json")
    }

    pub fn embeddings(&self) -> PathBuf {
        self.root.join("embeddings.json")
    }

    pub fn model(&self, kind: ModelKind) -> PathBuf {
        self.root.join(kind.artifact_file_name())
    }

    pub fn metrics(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    pub fn predictions(&self) -> PathBuf {
        self.root.join("predictions.csv")
    }

    pub fn gradcam_dir(&self) -> PathBuf {
        self.root.join("gradcam")
    }
}

/// Shared state handed to every stage.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub paths: ArtifactPaths,
    pub progress: ProgressConfig,
    pub multi_progress: Option<MultiProgress>,
    pub run_id: String,
    /// Recompute outputs that already exist.
    pub force: bool,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig, progress: ProgressConfig, run_id: &str, force: bool) -> Self {
        let paths = ArtifactPaths::new(&config.artifact_dir);
        let multi_progress = progress.create_multi_progress();
        Self {
            config,
            paths,
            progress,
            multi_progress,
            run_id: run_id.to_string(),
            force,
        }
    }
}
