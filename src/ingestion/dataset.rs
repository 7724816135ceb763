// src/ingestion/dataset.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::models::property::PropertyRecord;

/// Writes cleaned records with canonical headers. Absent optional columns are
/// written as empty fields.
pub fn write_records(path: &Path, records: &[PropertyRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create dataset file {}", path.display()))?;
    for record in records {
        writer
            .serialize(record)
            .with_context(|| format!("Failed to write record {} to {}", record.id, path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

/// Reads a cleaned dataset previously written by [`write_records`].
pub fn read_records(path: &Path) -> Result<Vec<PropertyRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open cleaned dataset {}", path.display()))?;
    let mut records = Vec::new();
    for (i, row) in reader.deserialize::<PropertyRecord>().enumerate() {
        let record = row.with_context(|| {
            format!("Malformed cleaned record at data row {} of {}", i + 1, path.display())
        })?;
        records.push(record);
    }
    Ok(records)
}
