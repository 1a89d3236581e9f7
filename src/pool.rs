//! The selected-query pool auto mode draws its sessions from.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::model::Task;
use crate::store::{DurableStore, keys};

/// Persisted list of queries under the `selected_queries` key.
#[derive(Clone)]
pub struct QueryPool {
    store: Arc<dyn DurableStore>,
}

impl QueryPool {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Every selected query, in insertion order.
    pub async fn list(&self) -> Result<Vec<Task>> {
        match self.store.get(keys::SELECTED_QUERIES).await? {
            Some(value) if !value.is_null() => Ok(serde_json::from_value(value)?),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn add(&self, task: Task) -> Result<bool> {
        Ok(self.add_many([task]).await? == 1)
    }

    /// Add queries not already in the pool. Returns how many were added.
    ///
    /// Queries are trimmed and blank ones ignored. The pool holds each query
    /// once, so a session never draws the same query twice.
    pub async fn add_many(&self, tasks: impl IntoIterator<Item = Task>) -> Result<usize> {
        let mut pool = self.list().await?;
        let before = pool.len();
        for task in tasks {
            let trimmed = task.as_str().trim();
            if trimmed.is_empty() || pool.iter().any(|t| t.as_str() == trimmed) {
                continue;
            }
            pool.push(Task::new(trimmed));
        }
        let added = pool.len() - before;
        if added > 0 {
            self.store
                .set(keys::SELECTED_QUERIES, serde_json::to_value(&pool)?)
                .await?;
        }
        debug!(added, total = pool.len(), "query pool updated");
        Ok(added)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store
            .set(keys::SELECTED_QUERIES, serde_json::Value::Array(Vec::new()))
            .await
    }
}
