// src/embedding/extraction.rs
use anyhow::{Context, Result};
use indicatif::ProgressBar;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::backbone::Backbone;
use super::EmbeddingSlot;
use crate::imagery::ImageManifest;
use crate::models::property::PropertyRecord;

/// Embeddings keyed by property id, tagged with the backbone that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTable {
    pub backbone_fingerprint: String,
    pub dim: usize,
    /// SHA-256 of the image manifest the table was extracted from.
    #[serde(default)]
    pub manifest_digest: Option<String>,
    pub entries: BTreeMap<i64, Vec<f32>>,
}

impl EmbeddingTable {
    pub fn new(backbone_fingerprint: &str, dim: usize) -> Self {
        Self {
            backbone_fingerprint: backbone_fingerprint.to_string(),
            dim,
            manifest_digest: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn slot(&self, id: i64) -> EmbeddingSlot<'_> {
        match self.entries.get(&id) {
            Some(vector) => EmbeddingSlot::Present(vector),
            None => EmbeddingSlot::Missing,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string(self).context("Failed to serialize embedding table")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read embedding table {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed embedding table {}", path.display()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionStats {
    pub embedded: usize,
    /// No tile in the manifest.
    pub missing: usize,
    /// Tile listed but unreadable or undecodable.
    pub unreadable: usize,
}

/// Embeds every record's tile. Records without a usable tile simply get no
/// entry, which reads back as [`EmbeddingSlot::Missing`].
pub fn extract_embeddings(
    backbone: &Backbone,
    records: &[PropertyRecord],
    manifest: &ImageManifest,
    progress: Option<ProgressBar>,
) -> Result<(EmbeddingTable, ExtractionStats)> {
    let mut table = EmbeddingTable::new(backbone.fingerprint(), backbone.dim());
    let mut stats = ExtractionStats::default();
    // Tiles shared by several properties are embedded once.
    let mut by_path: BTreeMap<&Path, Vec<f32>> = BTreeMap::new();

    if let Some(pb) = &progress {
        pb.set_length(records.len() as u64);
    }

    for record in records {
        if let Some(pb) = &progress {
            pb.inc(1);
        }
        let Some(path) = manifest.image_for(record.id) else {
            stats.missing += 1;
            continue;
        };
        if let Some(vector) = by_path.get(path) {
            table.entries.insert(record.id, vector.clone());
            stats.embedded += 1;
            continue;
        }

        let embedded = fs::read(path)
            .with_context(|| format!("Failed to read tile {}", path.display()))
            .and_then(|bytes| backbone.embed_bytes(&bytes));
        match embedded {
            Ok(vector) => {
                by_path.insert(path, vector.clone());
                table.entries.insert(record.id, vector);
                stats.embedded += 1;
            }
            Err(e) => {
                warn!("Property {}: treating image as missing: {:#}", record.id, e);
                stats.unreadable += 1;
            }
        }
    }

    if let Some(pb) = &progress {
        pb.finish_with_message(format!(
            "{} embedded, {} missing",
            stats.embedded,
            stats.missing + stats.unreadable
        ));
    }
    Ok((table, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::BackboneArch;
    use crate::imagery::{ImageEntry, ImageStatus, TileSpec};
    use crate::testing::{png_bytes, record};
    use candle_core::Device;
    use std::path::PathBuf;

    #[test]
    fn test_missing_and_broken_tiles_become_missing_slots() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        let broken = dir.path().join("broken.png");
        fs::write(&good, png_bytes(9)).unwrap();
        fs::write(&broken, b"garbage").unwrap();

        let mut manifest = ImageManifest::new(TileSpec::default());
        let entry = |path: PathBuf, status| ImageEntry {
            lat: 47.5,
            lon: -122.2,
            path,
            status,
        };
        manifest.entries.insert(1, entry(good.clone(), ImageStatus::Downloaded));
        manifest.entries.insert(2, entry(good, ImageStatus::Cached));
        manifest.entries.insert(3, entry(broken, ImageStatus::Cached));
        manifest.entries.insert(
            4,
            entry(
                dir.path().join("none.png"),
                ImageStatus::Missing {
                    reason: "no imagery at this location".into(),
                },
            ),
        );

        let tensors = Backbone::seeded_tensors(3, &Device::Cpu).unwrap();
        let backbone = Backbone::from_tensors(BackboneArch::Compact, tensors, 32, &Device::Cpu).unwrap();
        let records: Vec<_> = (1..=5).map(|id| record(id, 400000.0)).collect();
        let (table, stats) = extract_embeddings(&backbone, &records, &manifest, None).unwrap();

        assert_eq!(stats.embedded, 2);
        assert_eq!(stats.unreadable, 1);
        assert_eq!(stats.missing, 2);
        assert_eq!(table.slot(1), table.slot(2));
        assert!(table.slot(1).is_present());
        assert_eq!(table.slot(3), EmbeddingSlot::Missing);
        assert_eq!(table.slot(5), EmbeddingSlot::Missing);

        let path = dir.path().join("embeddings.json");
        table.save(&path).unwrap();
        assert_eq!(EmbeddingTable::load(&path).unwrap(), table);
    }
}
