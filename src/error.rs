//! Error types for probe-engine.

use thiserror::Error;

use crate::worker::ProviderError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("a run is already in progress")]
    Busy,

    #[error("no paused run to resume")]
    NoPendingRun,

    #[error("failed to acquire worker resource: {0}")]
    Acquisition(#[source] ProviderError),

    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
