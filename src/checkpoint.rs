//! Checkpoint store: the persisted run position and the executed log.
//!
//! Only the execution controller writes here, and only one run is ever
//! active, so whole-value replacement is enough. Readers must tolerate the
//! checkpoint changing between two reads.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::model::{ExecutedRecord, ExecutionState};
use crate::store::{DurableStore, keys};

#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn DurableStore>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// The underlying durable store, shared with settings and the query pool.
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Read the checkpoint of the unfinished run, if any.
    ///
    /// A stored value that breaks the index invariant is an error rather
    /// than silently treated as idle.
    pub async fn read_execution_state(&self) -> Result<Option<ExecutionState>> {
        let Some(value) = self.store.get(keys::EXECUTION_STATE).await? else {
            return Ok(None);
        };
        if value.is_null() {
            return Ok(None);
        }
        let state: ExecutionState = serde_json::from_value(value)?;
        state.validate()?;
        Ok(Some(state))
    }

    /// Replace the checkpoint. `None` deletes it (the idle state).
    pub async fn write_execution_state(&self, state: Option<&ExecutionState>) -> Result<()> {
        match state {
            Some(state) => {
                debug!(
                    current_index = state.current_index,
                    total = state.total,
                    "checkpoint written"
                );
                self.store
                    .set(keys::EXECUTION_STATE, serde_json::to_value(state)?)
                    .await
            }
            None => {
                debug!("checkpoint cleared");
                self.store.remove(keys::EXECUTION_STATE).await
            }
        }
    }

    /// All executed records, oldest first.
    pub async fn executed_records(&self) -> Result<Vec<ExecutedRecord>> {
        match self.store.get(keys::EXECUTED_QUERIES).await? {
            Some(value) if !value.is_null() => Ok(serde_json::from_value(value)?),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn executed_count(&self) -> Result<usize> {
        Ok(self.executed_records().await?.len())
    }

    /// Append a run's records to the log in one write.
    pub async fn append_records(&self, batch: &[ExecutedRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut records = self.executed_records().await?;
        records.extend_from_slice(batch);
        self.store
            .set(keys::EXECUTED_QUERIES, serde_json::to_value(&records)?)
            .await?;
        debug!(appended = batch.len(), total = records.len(), "records appended");
        Ok(())
    }
}
