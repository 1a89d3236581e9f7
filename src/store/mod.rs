//! Durable key/value store abstraction.
//!
//! Everything the engine persists (checkpoint, executed log, settings,
//! selected queries, auto-mode flag) lives under a fixed key as a JSON
//! value. Backends: SQLite via [`crate::db::Db`], or [`MemoryStore`].

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Keys of the persisted layout.
pub mod keys {
    pub const EXECUTION_STATE: &str = "execution_state";
    pub const EXECUTED_QUERIES: &str = "executed_queries";
    pub const SELECTED_QUERIES: &str = "selected_queries";
    pub const AUTO_MODE: &str = "auto_mode";
    pub const SETTINGS: &str = "settings";
}

/// Generic get/set by key. Every `set` fully replaces the previous value.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Drop every key.
    async fn clear(&self) -> Result<()>;
}
