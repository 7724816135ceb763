// src/utils/logging.rs - Logging helpers shared by the pipeline stages
use log::{debug, error, info, warn};
use std::time::Instant;

use crate::models::stats_models::{AcquisitionStats, IngestReport, PipelineStage};

#[derive(Clone)]
pub struct StageLogger {
    stage_name: &'static str,
    stage_emoji: &'static str,
    start_time: Instant,
}

impl StageLogger {
    pub fn new(stage: PipelineStage) -> Self {
        Self {
            stage_name: stage.as_str(),
            stage_emoji: stage.emoji(),
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, run_id: &str) {
        info!(
            "[{}] {} 🚀 Starting {} (run ID: {})",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            self.stage_name,
            run_id
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        let msg = if let Some(details) = details {
            format!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.stage_name.to_uppercase(),
                self.stage_emoji,
                phase,
                details,
                elapsed.as_secs_f32()
            )
        } else {
            format!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.stage_name.to_uppercase(),
                self.stage_emoji,
                phase,
                elapsed.as_secs_f32()
            )
        };
        info!("{}", msg);
    }

    pub fn log_data_loaded(&self, count: usize, data_type: &str) {
        info!(
            "[{}] {} 📊 Loaded {} {}",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            count,
            data_type
        );
    }

    pub fn log_skipped(&self, reason: &str) {
        info!(
            "[{}] {} ⏭️  Skipping: {}",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            reason
        );
    }

    pub fn log_ingest_report(&self, report: &IngestReport) {
        info!(
            "[{}] {} ✅ Cleaning complete: {} rows read → {} kept ({} dropped, {} values imputed, {} clipped)",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            report.rows_read,
            report.rows_kept,
            report.total_dropped(),
            report.total_imputed(),
            report.clipped_values
        );
        self.log_data_quality_issue("rows missing id/coordinates/price", report.dropped_missing_key);
        self.log_data_quality_issue("duplicate property ids", report.dropped_duplicate_id);
        self.log_data_quality_issue("invalid coordinates", report.dropped_invalid_coordinate);
        self.log_data_quality_issue("outlier rows removed", report.dropped_outlier);
        for (column, count) in &report.imputed {
            if *count > 0 {
                info!(
                    "[{}] {} 🩹 Imputed {} missing values in '{}' with the column median",
                    self.stage_name.to_uppercase(),
                    self.stage_emoji,
                    count,
                    column
                );
            }
        }
        if !report.absent_optional_columns.is_empty() {
            info!(
                "[{}] {} ℹ️  Optional columns not present in input: {:?}",
                self.stage_name.to_uppercase(),
                self.stage_emoji,
                report.absent_optional_columns
            );
        }
        info!(
            "[{}] {} ✂️  Split: {} training rows, {} held-out rows",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            report.train_rows,
            report.holdout_rows
        );
    }

    pub fn log_acquisition(&self, stats: &AcquisitionStats) {
        let duration = self.start_time.elapsed();
        info!(
            "[{}] {} 🎉 COMPLETED in {:.2?}: {} requested, {} downloaded, {} already cached, {} missing",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            duration,
            stats.requested,
            stats.downloaded,
            stats.cached,
            stats.missing
        );
        if stats.retries > 0 {
            info!(
                "[{}] {} 🔁 {} retries were needed",
                self.stage_name.to_uppercase(),
                self.stage_emoji,
                stats.retries
            );
        }
        if stats.skipped_over_cap > 0 {
            warn!(
                "[{}] {} ⚠️  Download cap reached, {} properties not attempted",
                self.stage_name.to_uppercase(),
                self.stage_emoji,
                stats.skipped_over_cap
            );
        }
    }

    /// Tile cache hit rate over the properties that ended up with a tile.
    pub fn log_cache_stats(&self, stats: &AcquisitionStats) {
        let served = stats.cached + stats.downloaded;
        if served == 0 {
            return;
        }
        info!(
            "[{}] {} 🗄️  Tile cache: {} hits, {} misses ({:.1}% hit rate)",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            stats.cached,
            stats.downloaded,
            100.0 * stats.cached as f64 / served as f64
        );
    }

    pub fn log_completion(&self, summary: &str) {
        let duration = self.start_time.elapsed();
        info!(
            "[{}] {} 🎉 COMPLETED in {:.2?}: {}",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            duration,
            summary
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            "[{}] {} ⚠️  {}",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            "[{}] {} ❌ {}",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            message
        );
    }

    pub fn log_debug(&self, message: &str) {
        debug!(
            "[{}] {} {}",
            self.stage_name.to_uppercase(),
            self.stage_emoji,
            message
        );
    }

    pub fn log_data_quality_issue(&self, issue_type: &str, count: usize) {
        if count > 0 {
            warn!(
                "[{}] {} ⚠️  Data quality: {} instances of {}",
                self.stage_name.to_uppercase(),
                self.stage_emoji,
                count,
                issue_type
            );
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}
