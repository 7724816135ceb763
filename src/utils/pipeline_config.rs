// src/utils/pipeline_config.rs
use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::embedding::{BackboneArch, MissingImagePolicy};
use crate::imagery::acquisition::RetryPolicy;
use crate::imagery::provider::TileSpec;
use crate::ingestion::{ColumnMapping, OutlierAction, OutlierPolicy};
use crate::utils::env::var_or;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub columns: ColumnMapping,
    pub holdout_fraction: f64,
    pub seed: u64,
    pub outliers: Option<OutlierPolicy>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            columns: ColumnMapping::default(),
            holdout_fraction: 0.2,
            seed: 42,
            outliers: Some(OutlierPolicy {
                iqr_factor: 3.0,
                action: OutlierAction::Remove,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageryConfig {
    pub base_url: String,
    pub tile: TileSpec,
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub request_delay: Duration,
    pub max_downloads: Option<usize>,
    pub request_timeout: Duration,
}

impl Default for ImageryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mapbox.com".to_string(),
            tile: TileSpec::default(),
            retry: RetryPolicy::default(),
            concurrency: 4,
            request_delay: Duration::from_millis(100),
            max_downloads: Some(6000),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackboneConfig {
    pub arch: BackboneArch,
    /// Safetensors file named the torchvision way (`conv1.weight`,
    /// `layer1.0.bn1.running_mean`, ...). Without it the seeded compact net
    /// is used whatever `arch` says.
    pub weights_path: Option<PathBuf>,
    pub seed: u64,
    /// Square input side; `None` uses the architecture's default.
    pub input_size: Option<usize>,
}

impl BackboneConfig {
    pub fn input_size_for(&self, arch: BackboneArch) -> usize {
        self.input_size.unwrap_or_else(|| arch.default_input_size())
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            arch: BackboneArch::ResNet18,
            weights_path: None,
            seed: 7,
            input_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub cv_folds: usize,
    pub ridge_alphas: Vec<f64>,
    pub forest_trees: u16,
    pub forest_max_depth: u16,
    pub log_target: bool,
    pub seed: u64,
    pub missing_image_policy: MissingImagePolicy,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            cv_folds: 5,
            ridge_alphas: vec![0.1, 1.0, 10.0, 100.0],
            forest_trees: 100,
            forest_max_depth: 12,
            log_target: true,
            seed: 42,
            missing_image_policy: MissingImagePolicy::ZeroFill,
        }
    }
}

/// Everything a pipeline run needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub artifact_dir: PathBuf,
    pub image_dir: PathBuf,
    pub ingest: IngestConfig,
    pub imagery: ImageryConfig,
    pub backbone: BackboneConfig,
    pub training: TrainingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("artifacts"),
            image_dir: PathBuf::from("data/images"),
            ingest: IngestConfig::default(),
            imagery: ImageryConfig::default(),
            backbone: BackboneConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut columns = ColumnMapping::default();
        columns.apply_env_overrides();

        let outliers = match env::var("VALUATION_OUTLIER_IQR_FACTOR") {
            Ok(v) if v.trim().eq_ignore_ascii_case("none") => None,
            _ => {
                let action = env::var("VALUATION_OUTLIER_ACTION")
                    .ok()
                    .and_then(|s| s.parse::<OutlierAction>().ok())
                    .unwrap_or(OutlierAction::Remove);
                Some(OutlierPolicy {
                    iqr_factor: var_or("VALUATION_OUTLIER_IQR_FACTOR", 3.0),
                    action,
                })
            }
        };

        let seed = var_or("VALUATION_SEED", defaults.ingest.seed);

        let (width, height) = env::var("MAPBOX_IMAGE_SIZE")
            .ok()
            .and_then(|s| TileSpec::parse_size(&s))
            .unwrap_or((defaults.imagery.tile.width, defaults.imagery.tile.height));

        let max_downloads = match env::var("VALUATION_MAX_DOWNLOADS") {
            Ok(v) if v.trim().eq_ignore_ascii_case("none") => None,
            Ok(v) => v.trim().parse().ok().or(defaults.imagery.max_downloads),
            Err(_) => defaults.imagery.max_downloads,
        };

        let ridge_alphas = env::var("VALUATION_RIDGE_ALPHAS")
            .ok()
            .map(|s| {
                s.split(',')
                    .filter_map(|a| a.trim().parse::<f64>().ok())
                    .filter(|a| *a > 0.0)
                    .collect::<Vec<_>>()
            })
            .filter(|alphas| !alphas.is_empty())
            .unwrap_or_else(|| defaults.training.ridge_alphas.clone());

        let missing_image_policy = env::var("VALUATION_MISSING_IMAGE_POLICY")
            .ok()
            .and_then(|s| s.parse::<MissingImagePolicy>().ok())
            .unwrap_or(defaults.training.missing_image_policy);

        Self {
            artifact_dir: env::var("VALUATION_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            image_dir: env::var("VALUATION_IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.image_dir),
            ingest: IngestConfig {
                columns,
                holdout_fraction: var_or(
                    "VALUATION_HOLDOUT_FRACTION",
                    defaults.ingest.holdout_fraction,
                ),
                seed,
                outliers,
            },
            imagery: ImageryConfig {
                base_url: env::var("MAPBOX_BASE_URL").unwrap_or(defaults.imagery.base_url),
                tile: TileSpec {
                    style: env::var("MAPBOX_STYLE").unwrap_or(defaults.imagery.tile.style),
                    zoom: var_or("MAPBOX_ZOOM", defaults.imagery.tile.zoom),
                    width,
                    height,
                },
                retry: RetryPolicy {
                    max_attempts: var_or(
                        "VALUATION_FETCH_MAX_ATTEMPTS",
                        defaults.imagery.retry.max_attempts,
                    ),
                    base_delay: Duration::from_millis(var_or(
                        "VALUATION_FETCH_BACKOFF_MS",
                        defaults.imagery.retry.base_delay.as_millis() as u64,
                    )),
                    max_delay: Duration::from_millis(var_or(
                        "VALUATION_FETCH_BACKOFF_CAP_MS",
                        defaults.imagery.retry.max_delay.as_millis() as u64,
                    )),
                },
                concurrency: var_or("VALUATION_FETCH_CONCURRENCY", defaults.imagery.concurrency)
                    .max(1),
                request_delay: Duration::from_millis(var_or(
                    "VALUATION_REQUEST_DELAY_MS",
                    defaults.imagery.request_delay.as_millis() as u64,
                )),
                max_downloads,
                request_timeout: Duration::from_secs(var_or(
                    "VALUATION_REQUEST_TIMEOUT_SECS",
                    defaults.imagery.request_timeout.as_secs(),
                )),
            },
            backbone: BackboneConfig {
                arch: env::var("VALUATION_BACKBONE_ARCH")
                    .ok()
                    .and_then(|s| s.parse::<BackboneArch>().ok())
                    .unwrap_or(defaults.backbone.arch),
                weights_path: env::var("VALUATION_BACKBONE_WEIGHTS").ok().map(PathBuf::from),
                seed: var_or("VALUATION_BACKBONE_SEED", defaults.backbone.seed),
                input_size: env::var("VALUATION_BACKBONE_INPUT_SIZE")
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .or(defaults.backbone.input_size),
            },
            training: TrainingConfig {
                cv_folds: var_or("VALUATION_CV_FOLDS", defaults.training.cv_folds),
                ridge_alphas,
                forest_trees: var_or("VALUATION_FOREST_TREES", defaults.training.forest_trees),
                forest_max_depth: var_or(
                    "VALUATION_FOREST_MAX_DEPTH",
                    defaults.training.forest_max_depth,
                ),
                log_target: var_or("VALUATION_LOG_TARGET", defaults.training.log_target),
                seed,
                missing_image_policy,
            },
        }
    }

    pub fn log_config(&self) {
        info!("⚙️  Pipeline configuration:");
        info!("   Artifacts directory: {}", self.artifact_dir.display());
        info!("   Images directory: {}", self.image_dir.display());
        info!(
            "   Held-out fraction: {:.2}, seed: {}",
            self.ingest.holdout_fraction, self.ingest.seed
        );
        match &self.ingest.outliers {
            Some(policy) => info!(
                "   Outliers: {:?} beyond {:.1} x IQR",
                policy.action, policy.iqr_factor
            ),
            None => warn!("   Outlier handling DISABLED"),
        }
        info!(
            "   Tiles: style={}, zoom={}, size={}x{}",
            self.imagery.tile.style,
            self.imagery.tile.zoom,
            self.imagery.tile.width,
            self.imagery.tile.height
        );
        info!(
            "   Fetch: concurrency={}, max attempts={}, backoff={:?}..{:?}, delay={:?}, cap={:?}",
            self.imagery.concurrency,
            self.imagery.retry.max_attempts,
            self.imagery.retry.base_delay,
            self.imagery.retry.max_delay,
            self.imagery.request_delay,
            self.imagery.max_downloads
        );
        match &self.backbone.weights_path {
            Some(path) => info!(
                "   Backbone: {} weights from {}",
                self.backbone.arch,
                path.display()
            ),
            None => warn!(
                "   Backbone: no weights file, seeded compact net (seed {})",
                self.backbone.seed
            ),
        }
        info!(
            "   Training: {} CV folds, ridge alphas {:?}, forest {} trees (depth {}), log target={}",
            self.training.cv_folds,
            self.training.ridge_alphas,
            self.training.forest_trees,
            self.training.forest_max_depth,
            self.training.log_target
        );
        info!(
            "   Missing-image policy: {}",
            self.training.missing_image_policy
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_fetch_script_settings() {
        let config = PipelineConfig::default();
        assert_eq!(config.imagery.tile.style, "satellite-v9");
        assert_eq!(config.imagery.tile.zoom, 18);
        assert_eq!((config.imagery.tile.width, config.imagery.tile.height), (256, 256));
        assert_eq!(config.imagery.max_downloads, Some(6000));
        assert_eq!(config.imagery.request_delay, Duration::from_millis(100));
        assert_eq!(config.imagery.request_timeout, Duration::from_secs(10));
        assert_eq!(
            config.training.missing_image_policy,
            MissingImagePolicy::ZeroFill
        );
        assert_eq!(config.backbone.arch, BackboneArch::ResNet18);
        assert_eq!(config.backbone.input_size_for(BackboneArch::ResNet18), 224);
        assert_eq!(config.backbone.input_size_for(BackboneArch::Compact), 128);
    }
}
