// src/evaluation/predictions.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: i64,
    pub predicted_price: i64,
}

impl PredictionRecord {
    pub fn new(id: i64, price: f64) -> Self {
        Self {
            id,
            predicted_price: price.round() as i64,
        }
    }
}

/// Writes `id,predicted_price` rows in the given order, prices rounded to whole units.
pub fn write_predictions(path: &Path, predictions: &[(i64, f64)]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create predictions file {}", path.display()))?;
    // Explicit header so an empty file is still well-formed.
    writer.write_record(["id", "predicted_price"])?;
    for &(id, price) in predictions {
        let record = PredictionRecord::new(id, price);
        writer.write_record([record.id.to_string(), record.predicted_price.to_string()])?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(predictions.len())
}

pub fn read_predictions(path: &Path) -> Result<Vec<PredictionRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open predictions file {}", path.display()))?;
    reader
        .deserialize()
        .collect::<Result<Vec<PredictionRecord>, _>>()
        .with_context(|| format!("Malformed predictions file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prices_are_rounded_and_order_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        write_predictions(&path, &[(7, 285000.4), (1, 412345.6)]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "id,predicted_price\n7,285000\n1,412346\n");
        assert_eq!(
            read_predictions(&path).unwrap(),
            vec![PredictionRecord::new(7, 285000.0), PredictionRecord::new(1, 412346.0)]
        );
    }

    #[test]
    fn test_empty_file_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        write_predictions(&path, &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "id,predicted_price\n");
    }
}
