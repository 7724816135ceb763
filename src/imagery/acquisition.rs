// src/imagery/acquisition.rs
use anyhow::Result;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use super::cache::TileCache;
use super::manifest::{ImageEntry, ImageManifest, ImageStatus};
use super::provider::{FetchError, TileProvider, TileRequest};
use crate::models::property::PropertyRecord;
use crate::models::stats_models::AcquisitionStats;
use crate::utils::pipeline_config::ImageryConfig;

/// Bounded exponential backoff for retryable fetch failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Result of fetching one tile with retries.
#[derive(Debug)]
pub struct FetchAttempt {
    pub result: Result<Bytes, FetchError>,
    pub retries: u32,
}

pub async fn fetch_with_retry<P: TileProvider>(
    provider: &P,
    request: &TileRequest,
    policy: &RetryPolicy,
) -> FetchAttempt {
    let max_attempts = policy.max_attempts.max(1);
    let mut retries = 0;
    loop {
        match provider.fetch(request).await {
            Ok(bytes) => {
                return FetchAttempt {
                    result: Ok(bytes),
                    retries,
                }
            }
            Err(e) if e.is_retryable() && retries + 1 < max_attempts => {
                retries += 1;
                let delay = policy.delay_for(retries);
                debug!(
                    "Tile ({:.6}, {:.6}): {}; retry {} in {:?}",
                    request.lat, request.lon, e, retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return FetchAttempt {
                    result: Err(e),
                    retries,
                }
            }
        }
    }
}

#[derive(Debug)]
enum TileOutcome {
    Downloaded,
    Cached,
    Missing(String),
}

struct TileJob {
    path: PathBuf,
    request: TileRequest,
}

/// Fetches a tile for every record not already cached. Records sharing a
/// coordinate share one tile; at most `max_downloads` network fetches are
/// attempted. Fetch failures never abort the pass: the record is marked missing.
pub async fn acquire_images<P: TileProvider>(
    provider: &P,
    cache: &TileCache,
    records: &[PropertyRecord],
    config: &ImageryConfig,
    force: bool,
    progress: Option<ProgressBar>,
) -> Result<(ImageManifest, AcquisitionStats)> {
    let mut stats = AcquisitionStats {
        requested: records.len(),
        ..Default::default()
    };

    // Unique tiles in first-seen order.
    let mut jobs: Vec<TileJob> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::with_capacity(records.len());
    let mut record_paths: Vec<PathBuf> = Vec::with_capacity(records.len());
    for record in records {
        let request = TileRequest {
            lat: record.lat,
            lon: record.long,
            spec: config.tile.clone(),
        };
        let path = cache.path_for(&request);
        if seen.insert(path.clone()) {
            jobs.push(TileJob {
                path: path.clone(),
                request,
            });
        }
        record_paths.push(path);
    }

    // Tiles already on disk never count against the download cap.
    let mut outcomes: BTreeMap<PathBuf, TileOutcome> = BTreeMap::new();
    let mut pending = Vec::new();
    for job in jobs {
        if !force && cache.contains(&job.path).await {
            outcomes.insert(job.path, TileOutcome::Cached);
        } else {
            pending.push(job);
        }
    }
    if let Some(cap) = config.max_downloads {
        if pending.len() > cap {
            for job in pending.split_off(cap) {
                outcomes.insert(
                    job.path,
                    TileOutcome::Missing("download cap reached".to_string()),
                );
            }
        }
    }
    let capped_paths: HashSet<PathBuf> = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, TileOutcome::Missing(_)))
        .map(|(p, _)| p.clone())
        .collect();

    if let Some(pb) = &progress {
        pb.set_length(pending.len() as u64);
    }

    let fetched: Vec<(PathBuf, TileOutcome, u32)> = stream::iter(pending)
        .map(|job| {
            let progress = progress.clone();
            async move {
                let (outcome, retries) = fetch_tile(provider, cache, &job, config, force).await;
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
                (job.path, outcome, retries)
            }
        })
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;

    for (path, outcome, retries) in fetched {
        stats.retries += retries as usize;
        outcomes.insert(path, outcome);
    }

    let mut manifest = ImageManifest::new(config.tile.clone());
    let mut counted_downloads: HashSet<PathBuf> = HashSet::new();
    for (record, path) in records.iter().zip(record_paths) {
        let status = match outcomes.get(&path) {
            // Records sharing a fresh tile after the first see it as cached.
            Some(TileOutcome::Downloaded) if counted_downloads.insert(path.clone()) => {
                stats.downloaded += 1;
                ImageStatus::Downloaded
            }
            Some(TileOutcome::Downloaded) | Some(TileOutcome::Cached) | None => {
                stats.cached += 1;
                ImageStatus::Cached
            }
            Some(TileOutcome::Missing(reason)) => {
                stats.missing += 1;
                if capped_paths.contains(&path) {
                    stats.skipped_over_cap += 1;
                }
                ImageStatus::Missing {
                    reason: reason.clone(),
                }
            }
        };
        manifest.entries.insert(
            record.id,
            ImageEntry {
                lat: record.lat,
                lon: record.long,
                path,
                status,
            },
        );
    }

    if let Some(pb) = &progress {
        pb.finish_with_message(format!(
            "{} downloaded, {} cached, {} missing",
            stats.downloaded, stats.cached, stats.missing
        ));
    }
    Ok((manifest, stats))
}

async fn fetch_tile<P: TileProvider>(
    provider: &P,
    cache: &TileCache,
    job: &TileJob,
    config: &ImageryConfig,
    force: bool,
) -> (TileOutcome, u32) {
    let _guard = cache.lock(&job.path).await;
    if !force && cache.contains(&job.path).await {
        return (TileOutcome::Cached, 0);
    }

    if !config.request_delay.is_zero() {
        tokio::time::sleep(config.request_delay).await;
    }

    let attempt = fetch_with_retry(provider, &job.request, &config.retry).await;
    match attempt.result {
        Ok(bytes) => match cache.store(&job.path, &bytes).await {
            Ok(()) => (TileOutcome::Downloaded, attempt.retries),
            Err(e) => {
                warn!("Failed to write tile {}: {}", job.path.display(), e);
                (
                    TileOutcome::Missing(format!("write failed: {}", e)),
                    attempt.retries,
                )
            }
        },
        Err(e) => {
            warn!(
                "No tile for ({:.6}, {:.6}) after {} attempt(s): {}",
                job.request.lat,
                job.request.lon,
                attempt.retries + 1,
                e
            );
            (TileOutcome::Missing(e.to_string()), attempt.retries)
        }
    }
}
