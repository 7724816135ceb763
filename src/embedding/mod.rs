//! Frozen CNN image embeddings.
//!
//! Every property gets an explicit [`EmbeddingSlot`]: `Present` when its tile
//! was embedded, `Missing` otherwise. What a model does with `Missing` is the
//! configured [`MissingImagePolicy`], never an implicit zero vector.

pub mod backbone;
pub mod extraction;
pub mod resnet;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use backbone::{shared_backbone, Backbone, BackboneArch};
pub use extraction::{extract_embeddings, EmbeddingTable, ExtractionStats};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmbeddingSlot<'a> {
    Present(&'a [f32]),
    Missing,
}

impl<'a> EmbeddingSlot<'a> {
    pub fn is_present(&self) -> bool {
        matches!(self, EmbeddingSlot::Present(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingImagePolicy {
    /// Drop properties without an embedding from image-consuming models and
    /// from the shared evaluation split.
    Exclude,
    /// Zero the embedding block and append a `has_image` indicator column.
    ZeroFill,
}

impl FromStr for MissingImagePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "exclude" | "drop" => Ok(MissingImagePolicy::Exclude),
            "zero-fill" | "zerofill" | "zero" => Ok(MissingImagePolicy::ZeroFill),
            other => Err(format!("unknown missing-image policy '{}'", other)),
        }
    }
}

impl fmt::Display for MissingImagePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingImagePolicy::Exclude => f.write_str("exclude"),
            MissingImagePolicy::ZeroFill => f.write_str("zero-fill"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("zero_fill".parse(), Ok(MissingImagePolicy::ZeroFill));
        assert_eq!("Exclude".parse(), Ok(MissingImagePolicy::Exclude));
        assert!("impute".parse::<MissingImagePolicy>().is_err());
        assert_eq!(MissingImagePolicy::ZeroFill.to_string(), "zero-fill");
    }
}
