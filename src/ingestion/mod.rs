//! Loading, validating and cleaning raw property records.
//!
//! Missing required columns and unparseable values reject the run. Rows that
//! lack an identifier, coordinate or (when labels are required) a price are
//! dropped. Outlier fences and imputation medians are fitted on the training
//! split only ([`Preprocessing`]) and reused for the held-out split and for
//! scoring. Every drop and imputation is counted in the [`IngestReport`].
//!
//! [`IngestReport`]: crate::models::stats_models::IngestReport

pub mod cleaning;
pub mod dataset;
pub mod split;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;

pub use cleaning::{parse_csv_file, parse_from_reader, ParsedDataset, Preprocessing, RawRecord};
pub use dataset::{read_records, write_records};
pub use split::split_holdout;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("Row {row}: column '{column}' has unparseable value '{value}'")]
    Unparseable {
        row: u64,
        column: String,
        value: String,
    },

    #[error("Column '{0}' has no values to impute from")]
    EmptyColumn(String),

    #[error("No usable rows remain after cleaning ({0} rows read)")]
    Empty(usize),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Canonical field names of the raw dataset (King County house-sales layout).
pub const ID_FIELD: &str = "id";
pub const PRICE_FIELD: &str = "price";
pub const CANONICAL_FIELDS: [&str; 15] = [
    "id",
    "lat",
    "long",
    "sqft_living",
    "sqft_lot",
    "bedrooms",
    "bathrooms",
    "grade",
    "yr_built",
    "price",
    "floors",
    "waterfront",
    "view",
    "condition",
    "yr_renovated",
];

/// Maps canonical field names to the header names used by a particular input file.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    overrides: BTreeMap<String, String>,
}

impl ColumnMapping {
    pub fn with_override(mut self, canonical: &str, header: &str) -> Self {
        self.overrides
            .insert(canonical.to_string(), header.to_string());
        self
    }

    /// Reads `VALUATION_COL_<FIELD>` for every canonical field.
    pub fn apply_env_overrides(&mut self) {
        for canonical in CANONICAL_FIELDS {
            let key = format!("VALUATION_COL_{}", canonical.to_uppercase());
            if let Ok(header) = env::var(&key) {
                if !header.trim().is_empty() {
                    self.overrides
                        .insert(canonical.to_string(), header.trim().to_string());
                }
            }
        }
    }

    pub fn header<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.overrides
            .get(canonical)
            .map(String::as_str)
            .unwrap_or(canonical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierAction {
    /// Drop rows with any guarded value outside the fences.
    Remove,
    /// Clamp guarded values to the fences.
    Clip,
}

impl FromStr for OutlierAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remove" | "drop" => Ok(OutlierAction::Remove),
            "clip" | "clamp" => Ok(OutlierAction::Clip),
            other => Err(format!("unknown outlier action '{}'", other)),
        }
    }
}

/// Tukey fences `[Q1 - k*IQR, Q3 + k*IQR]` over price, living area and lot size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierPolicy {
    pub iqr_factor: f64,
    pub action: OutlierAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_mapping_overrides() {
        let mapping = ColumnMapping::default().with_override("long", "lon");
        assert_eq!(mapping.header("long"), "lon");
        assert_eq!(mapping.header("lat"), "lat");
    }

    #[test]
    fn test_outlier_action_parsing() {
        assert_eq!("Clip".parse::<OutlierAction>(), Ok(OutlierAction::Clip));
        assert_eq!("drop".parse::<OutlierAction>(), Ok(OutlierAction::Remove));
        assert!("winsorize".parse::<OutlierAction>().is_err());
    }

    #[test]
    fn test_missing_columns_message_names_every_column() {
        let err = IngestError::MissingColumns(vec!["lat".into(), "price".into()]);
        assert_eq!(err.to_string(), "Missing required columns: lat, price");
    }
}
