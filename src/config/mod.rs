//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Per-run knobs (delays, session size) live in [`settings`] instead.

pub mod settings;

use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// TOML file overriding the stored run settings.
    pub settings_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: required_var("PROBE_DATABASE_URL")?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings_path: std::env::var("PROBE_SETTINGS").ok().map(PathBuf::from),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
