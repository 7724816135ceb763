// src/utils/env.rs
use anyhow::{anyhow, Result};
use log::{debug, info};
use std::env;
use std::str::FromStr;

/// Loads variables from a `.env` file in the working directory, if one exists.
pub fn load_env() {
    match dotenv::dotenv() {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) => debug!("No .env file loaded: {}", e),
    }
}

/// Reads a required secret such as an API token. Empty values count as missing.
pub fn require_var(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(anyhow!(
            "{} not found. Please set it in your environment or .env file.",
            name
        )),
    }
}

/// Parses an environment variable, falling back to `default` when unset or malformed.
pub fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}
