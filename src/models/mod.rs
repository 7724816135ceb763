pub mod artifact;
pub mod property;
pub mod stats_models;

pub use artifact::{FeatureSchema, ModelArtifact, ModelKind};
pub use property::{PropertyRecord, TabularColumn};
