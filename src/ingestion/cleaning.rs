// src/ingestion/cleaning.rs
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use super::{IngestError, OutlierAction, ID_FIELD, PRICE_FIELD};
use crate::models::property::PropertyRecord;
use crate::models::stats_models::IngestReport;
use crate::utils::pipeline_config::IngestConfig;

const COORDINATE_FIELDS: [&str; 2] = ["lat", "long"];
const REQUIRED_FEATURES: [&str; 6] = [
    "sqft_living",
    "sqft_lot",
    "bedrooms",
    "bathrooms",
    "grade",
    "yr_built",
];
const OPTIONAL_FEATURES: [&str; 5] = ["floors", "waterfront", "view", "condition", "yr_renovated"];
const OUTLIER_GUARDED: [&str; 3] = ["price", "sqft_living", "sqft_lot"];
const CATEGORICAL_FLAGS: [&str; 1] = ["waterfront"];
const MISSING_TOKENS: [&str; 6] = ["", "na", "n/a", "nan", "null", "none"];

/// A row that passed parsing and the row-level checks. Feature gaps are still
/// unfilled.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: i64,
    values: HashMap<&'static str, f64>,
}

impl RawRecord {
    pub fn value(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }
}

/// Parsed rows in input order, with the row-level part of the audit report.
#[derive(Debug, Clone)]
pub struct ParsedDataset {
    pub rows: Vec<RawRecord>,
    pub report: IngestReport,
}

pub fn parse_csv_file(
    path: &Path,
    config: &IngestConfig,
    require_price: bool,
) -> Result<ParsedDataset> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open input dataset {}", path.display()))?;
    let parsed = parse_from_reader(file, config, require_price)?;
    Ok(parsed)
}

/// Parses a raw CSV and drops rows that cannot be used at all: no identifier,
/// no coordinate, no price (when `require_price`), coordinates out of range,
/// or a repeated id. No statistics are computed here.
pub fn parse_from_reader<R: Read>(
    reader: R,
    config: &IngestConfig,
    require_price: bool,
) -> Result<ParsedDataset, IngestError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let position =
        |canonical: &str| headers.iter().position(|h| h == config.columns.header(canonical));

    let mut required: Vec<&'static str> = vec![ID_FIELD];
    required.extend(COORDINATE_FIELDS);
    required.extend(REQUIRED_FEATURES);
    if require_price {
        required.push(PRICE_FIELD);
    }
    let missing: Vec<String> = required
        .iter()
        .filter(|&&field| position(field).is_none())
        .map(|&field| config.columns.header(field).to_string())
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::MissingColumns(missing));
    }

    let id_position = position(ID_FIELD)
        .ok_or_else(|| IngestError::MissingColumns(vec![config.columns.header(ID_FIELD).into()]))?;

    let mut report = IngestReport::default();

    // Numeric fields present in this file, with their column positions.
    let mut numeric: Vec<(&'static str, usize)> = Vec::new();
    for &field in COORDINATE_FIELDS.iter().chain(REQUIRED_FEATURES.iter()) {
        if let Some(pos) = position(field) {
            numeric.push((field, pos));
        }
    }
    if let Some(pos) = position(PRICE_FIELD) {
        numeric.push((PRICE_FIELD, pos));
    }
    for field in OPTIONAL_FEATURES {
        match position(field) {
            Some(pos) => numeric.push((field, pos)),
            None => report.absent_optional_columns.push(field.to_string()),
        }
    }

    let mut rows: Vec<(Option<i64>, HashMap<&'static str, f64>)> = Vec::new();
    for result in csv_reader.records() {
        let row = result?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        report.rows_read += 1;

        let raw_id = row.get(id_position).unwrap_or("");
        let id = parse_id(raw_id).map_err(|_| IngestError::Unparseable {
            row: line,
            column: config.columns.header(ID_FIELD).to_string(),
            value: raw_id.to_string(),
        })?;

        let mut values = HashMap::with_capacity(numeric.len());
        for (field, pos) in &numeric {
            let raw = row.get(*pos).unwrap_or("");
            let value = parse_numeric(field, raw).map_err(|_| IngestError::Unparseable {
                row: line,
                column: config.columns.header(field).to_string(),
                value: raw.to_string(),
            })?;
            if let Some(value) = value {
                values.insert(*field, value);
            }
        }
        rows.push((id, values));
    }

    // Rows without identity, location or (when required) a label cannot be used.
    let before = rows.len();
    rows.retain(|(id, values)| {
        id.is_some()
            && values.contains_key("lat")
            && values.contains_key("long")
            && (!require_price || values.contains_key(PRICE_FIELD))
    });
    report.dropped_missing_key = before - rows.len();

    let before = rows.len();
    rows.retain(|(_, values)| {
        let lat_ok = values.get("lat").map_or(false, |v| (-90.0..=90.0).contains(v));
        let lon_ok = values.get("long").map_or(false, |v| (-180.0..=180.0).contains(v));
        lat_ok && lon_ok
    });
    report.dropped_invalid_coordinate = before - rows.len();

    let before = rows.len();
    let mut seen = HashSet::new();
    let rows: Vec<RawRecord> = rows
        .into_iter()
        .filter_map(|(id, values)| id.map(|id| RawRecord { id, values }))
        .filter(|row| seen.insert(row.id))
        .collect();
    report.dropped_duplicate_id = before - rows.len();

    if rows.is_empty() {
        return Err(IngestError::Empty(report.rows_read));
    }
    Ok(ParsedDataset { rows, report })
}

/// Outlier fences and imputation values, fitted once on the training rows and
/// reused for the held-out split and for scoring new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessing {
    /// Tukey fences `(low, high)` per guarded column.
    pub fences: BTreeMap<String, (f64, f64)>,
    pub outlier_action: Option<OutlierAction>,
    /// Training median per feature column. Optional columns without one are
    /// treated as absent.
    pub medians: BTreeMap<String, f64>,
}

impl Preprocessing {
    pub fn fit(rows: &[RawRecord], config: &IngestConfig) -> Result<Self, IngestError> {
        let mut fences = BTreeMap::new();
        if let Some(policy) = &config.outliers {
            for field in OUTLIER_GUARDED {
                let mut present: Vec<f64> = rows.iter().filter_map(|r| r.value(field)).collect();
                if present.len() < 4 {
                    continue;
                }
                present.sort_by(|a, b| a.total_cmp(b));
                let q1 = quantile_sorted(&present, 0.25);
                let q3 = quantile_sorted(&present, 0.75);
                let iqr = q3 - q1;
                let (low, high) = (q1 - policy.iqr_factor * iqr, q3 + policy.iqr_factor * iqr);
                debug!("Outlier fences for '{}': [{:.2}, {:.2}]", field, low, high);
                fences.insert(field.to_string(), (low, high));
            }
        }

        let mut fitted = Self {
            fences,
            outlier_action: config.outliers.map(|p| p.action),
            medians: BTreeMap::new(),
        };

        // Medians describe the training rows as they look after outlier handling.
        let kept = fitted.handle_outliers(rows.to_vec(), &mut IngestReport::default());
        if kept.is_empty() {
            return Err(IngestError::Empty(rows.len()));
        }
        for &field in REQUIRED_FEATURES.iter().chain(OPTIONAL_FEATURES.iter()) {
            let mut present: Vec<f64> = kept.iter().filter_map(|r| r.value(field)).collect();
            if present.is_empty() {
                if REQUIRED_FEATURES.contains(&field) {
                    return Err(IngestError::EmptyColumn(
                        config.columns.header(field).to_string(),
                    ));
                }
                continue;
            }
            fitted.medians.insert(field.to_string(), median(&mut present));
        }
        Ok(fitted)
    }

    fn handle_outliers(&self, mut rows: Vec<RawRecord>, report: &mut IngestReport) -> Vec<RawRecord> {
        let in_fence = |field: &str, v: f64| {
            self.fences
                .get(field)
                .map_or(true, |&(low, high)| v >= low && v <= high)
        };
        match self.outlier_action {
            None => {}
            Some(OutlierAction::Remove) => {
                let before = rows.len();
                rows.retain(|row| {
                    OUTLIER_GUARDED
                        .iter()
                        .all(|field| row.value(field).map_or(true, |v| in_fence(field, v)))
                });
                report.dropped_outlier += before - rows.len();
            }
            Some(OutlierAction::Clip) => {
                for row in rows.iter_mut() {
                    for (field, &(low, high)) in &self.fences {
                        if let Some(v) = row.values.get_mut(field.as_str()) {
                            let clamped = v.clamp(low, high);
                            if clamped != *v {
                                *v = clamped;
                                report.clipped_values += 1;
                            }
                        }
                    }
                }
            }
        }
        rows
    }

    /// Applies the fitted outlier handling (when `handle_outliers`) and fills
    /// feature gaps with the training medians. Columns absent from the input
    /// file are never filled.
    pub fn apply(
        &self,
        rows: Vec<RawRecord>,
        handle_outliers: bool,
        report: &mut IngestReport,
    ) -> Result<Vec<PropertyRecord>, IngestError> {
        let mut rows = if handle_outliers {
            self.handle_outliers(rows, report)
        } else {
            rows
        };

        for &field in OPTIONAL_FEATURES.iter() {
            if !self.medians.contains_key(field)
                && !report.absent_optional_columns.iter().any(|c| c == field)
            {
                report.absent_optional_columns.push(field.to_string());
            }
        }

        for &field in REQUIRED_FEATURES.iter().chain(OPTIONAL_FEATURES.iter()) {
            let Some(&fill) = self.medians.get(field) else {
                continue;
            };
            if report.absent_optional_columns.iter().any(|c| c == field) {
                continue;
            }
            let mut filled = 0usize;
            for row in rows.iter_mut() {
                if !row.values.contains_key(field) {
                    row.values.insert(field, fill);
                    filled += 1;
                }
            }
            *report.imputed.entry(field.to_string()).or_insert(0) += filled;
            if filled > 0 {
                debug!("Imputed {} values of '{}' with median {}", filled, field, fill);
            }
        }

        let records = rows
            .iter()
            .map(|row| self.to_record(row, report))
            .collect::<Result<Vec<_>, _>>()?;
        report.rows_kept += records.len();
        Ok(records)
    }

    fn to_record(&self, row: &RawRecord, report: &IngestReport) -> Result<PropertyRecord, IngestError> {
        let required = |field: &str| {
            row.value(field)
                .ok_or_else(|| IngestError::EmptyColumn(field.to_string()))
        };
        let optional = |field: &str| {
            if report.absent_optional_columns.iter().any(|c| c == field) {
                None
            } else {
                row.value(field)
            }
        };
        Ok(PropertyRecord {
            id: row.id,
            lat: required("lat")?,
            long: required("long")?,
            sqft_living: required("sqft_living")?,
            sqft_lot: required("sqft_lot")?,
            bedrooms: required("bedrooms")?,
            bathrooms: required("bathrooms")?,
            grade: required("grade")?,
            yr_built: required("yr_built")?,
            floors: optional("floors"),
            waterfront: optional("waterfront"),
            view: optional("view"),
            condition: optional("condition"),
            yr_renovated: optional("yr_renovated"),
            price: row.value(PRICE_FIELD),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize preprocessing")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read preprocessing {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed preprocessing {}", path.display()))
    }
}

fn is_missing_token(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    MISSING_TOKENS.contains(&lowered.as_str())
}

fn parse_id(raw: &str) -> Result<Option<i64>, ()> {
    if is_missing_token(raw) {
        return Ok(None);
    }
    if let Ok(id) = raw.trim().parse::<i64>() {
        return Ok(Some(id));
    }
    // Spreadsheet exports sometimes write integral ids as floats.
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 => Ok(Some(v as i64)),
        _ => Err(()),
    }
}

fn parse_numeric(field: &str, raw: &str) -> Result<Option<f64>, ()> {
    if is_missing_token(raw) {
        return Ok(None);
    }
    if CATEGORICAL_FLAGS.contains(&field) {
        return parse_flag(raw).map(Some);
    }
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(()),
    }
}

/// Normalizes yes/no style encodings to 1/0.
fn parse_flag(raw: &str) -> Result<f64, ()> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "1.0" | "y" | "yes" | "true" | "t" => Ok(1.0),
        "0" | "0.0" | "n" | "no" | "false" | "f" => Ok(0.0),
        _ => Err(()),
    }
}

/// Median of a non-empty slice; sorts in place.
pub(crate) fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Linear-interpolated quantile of a sorted, non-empty slice.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let weight = pos - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{ColumnMapping, OutlierPolicy};

    const HEADER: &str = "id,date,price,bedrooms,bathrooms,sqft_living,sqft_lot,floors,waterfront,grade,yr_built,lat,long";

    fn config_without_outliers() -> IngestConfig {
        IngestConfig {
            outliers: None,
            ..IngestConfig::default()
        }
    }

    fn parse(csv: &str, config: &IngestConfig) -> Result<ParsedDataset, IngestError> {
        parse_from_reader(csv.as_bytes(), config, true)
    }

    /// Fits on every row and applies to the same rows.
    fn clean(
        csv: &str,
        config: &IngestConfig,
    ) -> Result<(Vec<PropertyRecord>, IngestReport), IngestError> {
        let ParsedDataset { rows, mut report } = parse(csv, config)?;
        let fitted = Preprocessing::fit(&rows, config)?;
        let records = fitted.apply(rows, true, &mut report)?;
        Ok((records, report))
    }

    #[test]
    fn test_missing_required_columns_are_all_reported() {
        let csv = "id,price,bedrooms,bathrooms,sqft_living,sqft_lot,grade,yr_built\n1,300000,3,2,1800,5000,7,1990\n";
        let err = parse(csv, &config_without_outliers()).unwrap_err();
        match err {
            IngestError::MissingColumns(cols) => assert_eq!(cols, vec!["lat", "long"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_column_reported_under_configured_header() {
        let mut config = config_without_outliers();
        config.columns = ColumnMapping::default().with_override("price", "sale_price");
        let csv = format!("{HEADER}\n1,20141013T000000,221900,3,1,1180,5650,1,0,7,1955,47.51,-122.25\n");
        let err = parse(&csv, &config).unwrap_err();
        assert!(err.to_string().contains("sale_price"));
    }

    #[test]
    fn test_price_not_required_for_unlabeled_data() {
        let csv = "id,bedrooms,bathrooms,sqft_living,sqft_lot,grade,yr_built,lat,long\n5,3,2,1800,5000,7,1990,47.5,-122.2\n";
        let config = config_without_outliers();
        let ParsedDataset { rows, mut report } =
            parse_from_reader(csv.as_bytes(), &config, false).unwrap();
        let fitted = Preprocessing::fit(&rows, &config).unwrap();
        let records = fitted.apply(rows, false, &mut report).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].price, None);
    }

    #[test]
    fn test_unparseable_value_is_fatal_with_location() {
        let csv = format!(
            "{HEADER}\n1,d,221900,3,1,1180,5650,1,0,7,1955,47.51,-122.25\n2,d,538000,three,2.25,2570,7242,2,0,7,1951,47.72,-122.31\n"
        );
        let err = parse(&csv, &config_without_outliers()).unwrap_err();
        match err {
            IngestError::Unparseable { row, column, value } => {
                assert_eq!(row, 3);
                assert_eq!(column, "bedrooms");
                assert_eq!(value, "three");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_drops_and_imputes_are_counted() {
        let csv = format!(
            "{HEADER}\n\
             1,d,221900,3,1,1180,5650,1,N,7,1955,47.51,-122.25\n\
             2,d,538000,,2.25,2570,7242,2,Y,7,1951,47.72,-122.31\n\
             2,d,538000,3,2.25,2570,7242,2,0,7,1951,47.72,-122.31\n\
             3,d,180000,2,1,770,10000,1,0,6,1933,,-122.23\n\
             4,d,604000,4,3,1960,5000,1,0,7,1965,95.0,-122.39\n\
             5,d,,3,2,1680,8080,1,0,8,1987,47.61,-122.04\n\
             6,d,510000,5,2,1500,6000,1,0,7,1970,47.60,-122.10\n"
        );
        let (records, report) = clean(&csv, &config_without_outliers()).unwrap();
        assert_eq!(report.rows_read, 7);
        assert_eq!(report.dropped_missing_key, 2);
        assert_eq!(report.dropped_invalid_coordinate, 1);
        assert_eq!(report.dropped_duplicate_id, 1);
        assert_eq!(report.imputed.get("bedrooms"), Some(&1));
        assert_eq!(report.rows_kept, 3);

        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 6]);
        // Median of the remaining bedroom counts (3, 5).
        assert_eq!(records[1].bedrooms, 4.0);
        assert_eq!(records[0].waterfront, Some(0.0));
        assert_eq!(records[1].waterfront, Some(1.0));
        assert!(report
            .absent_optional_columns
            .contains(&"condition".to_string()));
        assert_eq!(records[0].condition, None);
    }

    #[test]
    fn test_held_out_gaps_are_filled_with_training_medians() {
        let config = config_without_outliers();
        let train_csv = format!(
            "{HEADER}\n\
             1,d,300000,2,1,1000,5000,1,0,7,1990,47.5,-122.2\n\
             2,d,310000,2,1,1100,5000,1,0,7,1990,47.5,-122.2\n\
             3,d,320000,2,1,1200,5000,1,0,7,1990,47.5,-122.2\n"
        );
        let holdout_csv = format!(
            "{HEADER}\n\
             10,d,900000,9,4,4000,9000,2,0,11,2010,47.6,-122.1\n\
             11,d,950000,,4,4200,9000,2,0,11,2012,47.6,-122.1\n"
        );
        let train = parse(&train_csv, &config).unwrap();
        let fitted = Preprocessing::fit(&train.rows, &config).unwrap();

        let ParsedDataset { rows, mut report } = parse(&holdout_csv, &config).unwrap();
        let holdout = fitted.apply(rows, true, &mut report).unwrap();
        assert_eq!(holdout[1].bedrooms, 2.0);
        assert_eq!(fitted.medians["bedrooms"], 2.0);
    }

    #[test]
    fn test_preprocessing_survives_disk() {
        let config = IngestConfig::default();
        let rows = parse(&outlier_csv(), &config).unwrap().rows;
        let fitted = Preprocessing::fit(&rows, &config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preprocessing.json");
        fitted.save(&path).unwrap();
        assert_eq!(Preprocessing::load(&path).unwrap(), fitted);
    }

    fn outlier_csv() -> String {
        let mut csv = format!("{HEADER}\n");
        for i in 0..20 {
            let price = 300_000 + i * 10_000;
            csv.push_str(&format!(
                "{i},d,{price},3,2,{},5000,1,0,7,1990,47.5,-122.2\n",
                1500 + i * 10
            ));
        }
        csv.push_str("99,d,25000000,3,2,1700,5000,1,0,7,1990,47.5,-122.2\n");
        csv
    }

    #[test]
    fn test_outlier_removal() {
        let config = IngestConfig {
            outliers: Some(OutlierPolicy {
                iqr_factor: 3.0,
                action: OutlierAction::Remove,
            }),
            ..IngestConfig::default()
        };
        let (records, report) = clean(&outlier_csv(), &config).unwrap();
        assert_eq!(report.dropped_outlier, 1);
        assert!(records.iter().all(|r| r.id != 99));
    }

    #[test]
    fn test_outlier_clipping_keeps_row() {
        let config = IngestConfig {
            outliers: Some(OutlierPolicy {
                iqr_factor: 3.0,
                action: OutlierAction::Clip,
            }),
            ..IngestConfig::default()
        };
        let (records, report) = clean(&outlier_csv(), &config).unwrap();
        assert_eq!(report.dropped_outlier, 0);
        assert_eq!(report.clipped_values, 1);
        let clipped = records.iter().find(|r| r.id == 99).unwrap();
        assert!(clipped.price.unwrap() < 25_000_000.0);
    }

    #[test]
    fn test_everything_dropped_is_an_error() {
        let csv = format!("{HEADER}\n1,d,,3,1,1180,5650,1,0,7,1955,47.51,-122.25\n");
        let err = parse(&csv, &config_without_outliers()).unwrap_err();
        assert!(matches!(err, IngestError::Empty(1)));
    }

    #[test]
    fn test_quantiles_and_median() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(median(&mut values), 2.5);
        assert_eq!(quantile_sorted(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.25), 2.0);
        assert_eq!(quantile_sorted(&[1.0, 2.0, 3.0, 4.0], 0.5), 2.5);
    }

    #[test]
    fn test_float_formatted_ids_are_accepted() {
        assert_eq!(parse_id("7129300520"), Ok(Some(7129300520)));
        assert_eq!(parse_id("12.0"), Ok(Some(12)));
        assert_eq!(parse_id(""), Ok(None));
        assert!(parse_id("12.5").is_err());
    }
}
