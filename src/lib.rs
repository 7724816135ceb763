pub mod embedding;
pub mod evaluation;
pub mod imagery;
pub mod ingestion;
pub mod interpretation;
pub mod models;
pub mod pipeline;
pub mod regression;
pub mod training;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
