// src/imagery/manifest.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::provider::TileSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageStatus {
    Downloaded,
    Cached,
    Missing { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub lat: f64,
    pub lon: f64,
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: ImageStatus,
}

impl ImageEntry {
    pub fn is_available(&self) -> bool {
        !matches!(self.status, ImageStatus::Missing { .. })
    }
}

/// Which tile each property maps to, and whether it was obtained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub tile: TileSpec,
    pub entries: BTreeMap<i64, ImageEntry>,
}

impl ImageManifest {
    pub fn new(tile: TileSpec) -> Self {
        Self {
            tile,
            entries: BTreeMap::new(),
        }
    }

    /// Path of the tile for `id`, if one was obtained.
    pub fn image_for(&self, id: i64) -> Option<&Path> {
        self.entries
            .get(&id)
            .filter(|entry| entry.is_available())
            .map(|entry| entry.path.as_path())
    }

    pub fn available_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_available()).count()
    }

    pub fn missing_count(&self) -> usize {
        self.entries.len() - self.available_count()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize image manifest")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read image manifest {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed image manifest {}", path.display()))
    }
}
