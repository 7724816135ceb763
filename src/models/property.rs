// src/models/property.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// One cleaned property. Optional structural attributes are `None` only when the
/// whole column was absent from the input; ingestion imputes per-row gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: i64,
    pub lat: f64,
    pub long: f64,
    pub sqft_living: f64,
    pub sqft_lot: f64,
    pub bedrooms: f64,
    pub bathrooms: f64,
    pub grade: f64,
    pub yr_built: f64,
    pub floors: Option<f64>,
    pub waterfront: Option<f64>,
    pub view: Option<f64>,
    pub condition: Option<f64>,
    pub yr_renovated: Option<f64>,
    pub price: Option<f64>,
}

/// Structured features a tabular model may consume, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabularColumn {
    SqftLiving,
    SqftLot,
    Bedrooms,
    Bathrooms,
    Grade,
    YrBuilt,
    Lat,
    Long,
    Floors,
    Waterfront,
    View,
    Condition,
    YrRenovated,
}

impl TabularColumn {
    pub const REQUIRED: [TabularColumn; 8] = [
        TabularColumn::SqftLiving,
        TabularColumn::SqftLot,
        TabularColumn::Bedrooms,
        TabularColumn::Bathrooms,
        TabularColumn::Grade,
        TabularColumn::YrBuilt,
        TabularColumn::Lat,
        TabularColumn::Long,
    ];

    pub const OPTIONAL: [TabularColumn; 5] = [
        TabularColumn::Floors,
        TabularColumn::Waterfront,
        TabularColumn::View,
        TabularColumn::Condition,
        TabularColumn::YrRenovated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TabularColumn::SqftLiving => "sqft_living",
            TabularColumn::SqftLot => "sqft_lot",
            TabularColumn::Bedrooms => "bedrooms",
            TabularColumn::Bathrooms => "bathrooms",
            TabularColumn::Grade => "grade",
            TabularColumn::YrBuilt => "yr_built",
            TabularColumn::Lat => "lat",
            TabularColumn::Long => "long",
            TabularColumn::Floors => "floors",
            TabularColumn::Waterfront => "waterfront",
            TabularColumn::View => "view",
            TabularColumn::Condition => "condition",
            TabularColumn::YrRenovated => "yr_renovated",
        }
    }

    pub fn value(&self, record: &PropertyRecord) -> Option<f64> {
        match self {
            TabularColumn::SqftLiving => Some(record.sqft_living),
            TabularColumn::SqftLot => Some(record.sqft_lot),
            TabularColumn::Bedrooms => Some(record.bedrooms),
            TabularColumn::Bathrooms => Some(record.bathrooms),
            TabularColumn::Grade => Some(record.grade),
            TabularColumn::YrBuilt => Some(record.yr_built),
            TabularColumn::Lat => Some(record.lat),
            TabularColumn::Long => Some(record.long),
            TabularColumn::Floors => record.floors,
            TabularColumn::Waterfront => record.waterfront,
            TabularColumn::View => record.view,
            TabularColumn::Condition => record.condition,
            TabularColumn::YrRenovated => record.yr_renovated,
        }
    }

    /// Columns with a value in every record: all required ones plus the optional
    /// columns the dataset actually carried.
    pub fn available(records: &[PropertyRecord]) -> Vec<TabularColumn> {
        let mut columns = Self::REQUIRED.to_vec();
        columns.extend(
            Self::OPTIONAL
                .iter()
                .copied()
                .filter(|c| !records.is_empty() && records.iter().all(|r| c.value(r).is_some())),
        );
        columns
    }
}

impl fmt::Display for TabularColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
