// src/utils/instantiate_run.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::stats_models::PipelineStats;

fn run_record_path(artifact_dir: &Path, run_id: &str) -> PathBuf {
    artifact_dir.join("runs").join(format!("{}.json", run_id))
}

/// Creates the run record and writes it immediately so an aborted run still
/// leaves a trace.
pub fn create_initial_pipeline_run(
    artifact_dir: &Path,
    run_id: &str,
    run_timestamp: DateTime<Utc>,
    description: Option<&str>,
) -> Result<PipelineStats> {
    let stats = PipelineStats {
        run_id: run_id.to_string(),
        run_timestamp,
        description: description.map(|s| s.to_string()),
        stages: BTreeMap::new(),
        total_processing_time: 0.0,
    };
    save_pipeline_run(artifact_dir, &stats)
        .context("Failed to write initial pipeline run record")?;

    info!("Created initial pipeline run record with ID: {}", run_id);
    Ok(stats)
}

/// Overwrites the run record with the latest stage outcomes.
pub fn save_pipeline_run(artifact_dir: &Path, stats: &PipelineStats) -> Result<PathBuf> {
    let path = run_record_path(artifact_dir, &stats.run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(stats).context("Failed to serialize run record")?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::stats_models::{PipelineStage, StageOutcome};

    #[test]
    fn test_run_record_is_rewritten_with_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats =
            create_initial_pipeline_run(dir.path(), "run-1", Utc::now(), Some("test run")).unwrap();
        stats.stages.insert(
            PipelineStage::TrainImage,
            StageOutcome::Failed {
                error: "singular system".to_string(),
            },
        );
        let path = save_pipeline_run(dir.path(), &stats).unwrap();
        assert_eq!(path, dir.path().join("runs").join("run-1.json"));

        let loaded: PipelineStats =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.description.as_deref(), Some("test run"));
        assert_eq!(loaded.failed_stages(), vec![PipelineStage::TrainImage]);
    }
}
