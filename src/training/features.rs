// src/training/features.rs
use ndarray::{Array1, Array2};

use super::TrainingError;
use crate::embedding::{EmbeddingSlot, EmbeddingTable, MissingImagePolicy};
use crate::models::artifact::{EmbeddingSchema, FeatureSchema, ModelKind, SchemaError};
use crate::models::property::{PropertyRecord, TabularColumn};

/// Rows ready for a regressor, aligned with the ids they came from.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub ids: Vec<i64>,
    pub x: Array2<f64>,
    pub prices: Vec<Option<f64>>,
    /// Ids dropped under [`MissingImagePolicy::Exclude`].
    pub excluded: Vec<i64>,
}

impl DesignMatrix {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub fn embedding_schema(table: &EmbeddingTable) -> EmbeddingSchema {
    EmbeddingSchema {
        dim: table.dim,
        backbone_fingerprint: table.backbone_fingerprint.clone(),
    }
}

/// Derives the schema a new model of `kind` will be trained with.
pub fn build_schema(
    kind: ModelKind,
    records: &[PropertyRecord],
    embeddings: Option<&EmbeddingTable>,
    policy: MissingImagePolicy,
) -> Result<FeatureSchema, SchemaError> {
    let (tabular_columns, omitted_columns) = if kind.uses_tabular() {
        let available = TabularColumn::available(records);
        let omitted = TabularColumn::OPTIONAL
            .iter()
            .copied()
            .filter(|c| !available.contains(c))
            .collect();
        (available, omitted)
    } else {
        (Vec::new(), Vec::new())
    };

    let (embedding, missing_image_policy) = if kind.uses_images() {
        let table = embeddings.ok_or(SchemaError::EmbeddingsRequired(kind))?;
        (Some(embedding_schema(table)), Some(policy))
    } else {
        (None, None)
    };

    Ok(FeatureSchema {
        kind,
        tabular_columns,
        omitted_columns,
        embedding,
        missing_image_policy,
    })
}

/// Lays records out as `[tabular | embedding | has_image]` per `schema`,
/// applying its missing-image policy.
pub fn build_design(
    schema: &FeatureSchema,
    records: &[PropertyRecord],
    embeddings: Option<&EmbeddingTable>,
) -> Result<DesignMatrix, SchemaError> {
    let available = TabularColumn::available(records);
    let presented = embeddings.map(embedding_schema);
    schema.check_inputs(&available, presented.as_ref())?;

    let width = schema.width();
    let mut values = Vec::with_capacity(records.len() * width);
    let mut ids = Vec::with_capacity(records.len());
    let mut prices = Vec::with_capacity(records.len());
    let mut excluded = Vec::new();

    for record in records {
        let mut row: Vec<f64> = Vec::with_capacity(width);
        for column in &schema.tabular_columns {
            // Availability was checked above; a gap here is still a mismatch.
            let value = column.value(record).ok_or(SchemaError::Mismatch {
                what: "tabular columns",
                expected: column.name().to_string(),
                found: format!("no value for property {}", record.id),
            })?;
            row.push(value);
        }

        if let (Some(embedding), Some(table)) = (&schema.embedding, embeddings) {
            match table.slot(record.id) {
                EmbeddingSlot::Present(vector) => {
                    row.extend(vector.iter().map(|&v| v as f64));
                    if schema.has_image_indicator() {
                        row.push(1.0);
                    }
                }
                EmbeddingSlot::Missing => match schema.missing_image_policy {
                    Some(MissingImagePolicy::ZeroFill) => {
                        row.extend(std::iter::repeat(0.0).take(embedding.dim));
                        row.push(0.0);
                    }
                    _ => {
                        excluded.push(record.id);
                        continue;
                    }
                },
            }
        }

        values.extend(row);
        ids.push(record.id);
        prices.push(record.price);
    }

    let x = Array2::from_shape_vec((ids.len(), width), values).map_err(|e| {
        SchemaError::Mismatch {
            what: "design matrix shape",
            expected: format!("{} x {}", ids.len(), width),
            found: e.to_string(),
        }
    })?;
    Ok(DesignMatrix {
        ids,
        x,
        prices,
        excluded,
    })
}

/// Regression targets, optionally in log space. Every row needs a positive price.
pub fn targets(prices: &[Option<f64>], log_target: bool) -> Result<Array1<f64>, TrainingError> {
    prices
        .iter()
        .map(|p| match p {
            Some(price) if price.is_finite() && (!log_target || *price > 0.0) => {
                Ok(if log_target { price.ln() } else { *price })
            }
            _ => Err(TrainingError::NonFinite("prices")),
        })
        .collect()
}

pub fn to_price(prediction: f64, log_target: bool) -> f64 {
    if log_target {
        prediction.exp()
    } else {
        prediction
    }
}
