pub mod candle;
pub mod env;
pub mod instantiate_run;
pub mod logging;
pub mod pipeline_config;
pub mod progress_config;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

pub async fn get_memory_usage() -> u64 {
    use sysinfo::System;
    let mut sys = System::new_all();
    sys.refresh_memory();
    sys.used_memory() / (1024 * 1024) // Convert to MB
}

/// Hex SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
