//! Progress and completion events emitted by the execution controller.
//!
//! Delivery is best-effort: events go out on a broadcast channel and are
//! dropped when nobody is listening. Listeners may subscribe and go away
//! at any time without affecting a run.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered events per listener before the slowest one starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// A structured event emitted by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Progress {
        current: usize,
        total: usize,
    },
    Complete {
        records_this_run: usize,
        finished: bool,
        paused_at_index: Option<usize>,
    },
}

/// Fire-and-forget broadcaster for run events.
pub struct Notifier {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    /// Register a listener. Only events published after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish_progress(&self, current: usize, total: usize) {
        self.publish(EventKind::Progress { current, total });
    }

    pub fn publish_completion(
        &self,
        records_this_run: usize,
        finished: bool,
        paused_at_index: Option<usize>,
    ) {
        self.publish(EventKind::Complete {
            records_this_run,
            finished,
            paused_at_index,
        });
    }

    fn publish(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };
        // No receivers is the normal idle case.
        if self.tx.send(event).is_err() {
            trace!("no event listeners");
        }
    }
}
