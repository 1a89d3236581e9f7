//! Run settings and where they come from.
//!
//! The controller reads settings once at the start of every run through a
//! [`SettingsProvider`]. They are normally kept in the durable store
//! ([`StoredSettings`]) but can be pinned from a TOML file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::SearchEngine;
use crate::store::{DurableStore, keys};

/// Knobs read at the start of each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pause between two consecutive tasks.
    pub delay_between_queries_ms: u64,
    /// Destroy the worker resource when a run ends instead of keeping it for
    /// the next run.
    pub close_resource_on_completion: bool,
    /// Upper bound on tasks per auto-mode session.
    pub queries_per_session: usize,
    pub auto_mode_interval_ms: u64,
    pub search_engine: SearchEngine,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            delay_between_queries_ms: 3000,
            close_resource_on_completion: true,
            queries_per_session: 10,
            auto_mode_interval_ms: 3_600_000,
            search_engine: SearchEngine::Google,
        }
    }
}

impl Settings {
    pub fn delay_between_queries(&self) -> Duration {
        Duration::from_millis(self.delay_between_queries_ms)
    }

    pub fn auto_mode_interval(&self) -> Duration {
        Duration::from_millis(self.auto_mode_interval_ms)
    }

    /// Parse settings from a TOML file. Missing fields take defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }
}

/// Supplies [`Settings`] to the controller.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn load(&self) -> Result<Settings>;
}

/// A fixed settings value.
#[async_trait]
impl SettingsProvider for Settings {
    async fn load(&self) -> Result<Settings> {
        Ok(self.clone())
    }
}

/// Settings persisted under the `settings` key, defaulting when absent.
#[derive(Clone)]
pub struct StoredSettings {
    store: Arc<dyn DurableStore>,
}

impl StoredSettings {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, settings: &Settings) -> Result<()> {
        self.store
            .set(keys::SETTINGS, serde_json::to_value(settings)?)
            .await
    }
}

#[async_trait]
impl SettingsProvider for StoredSettings {
    async fn load(&self) -> Result<Settings> {
        match self.store.get(keys::SETTINGS).await? {
            Some(value) if !value.is_null() => Ok(serde_json::from_value(value)?),
            _ => Ok(Settings::default()),
        }
    }
}
