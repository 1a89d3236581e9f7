//! Core data model.
//!
//! A task is one search query. A run walks an ordered queue of tasks and
//! checkpoints its position after every one, so the queue can be resumed
//! after a stop or a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of work: an opaque query string.
///
/// Equality is by value. Duplicate tasks in a queue are executed
/// independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task(String);

impl Task {
    pub fn new(query: impl Into<String>) -> Self {
        Self(query.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Task {
    fn from(query: String) -> Self {
        Self(query)
    }
}

impl From<&str> for Task {
    fn from(query: &str) -> Self {
        Self(query.to_string())
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Execution State
// ---------------------------------------------------------------------------

/// Persisted checkpoint of an unfinished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub queue: Vec<Task>,
    /// Index of the next task to execute.
    pub current_index: usize,
    pub total: usize,
}

impl ExecutionState {
    /// A fresh checkpoint positioned at the first task.
    pub fn new(queue: Vec<Task>) -> Self {
        let total = queue.len();
        Self {
            queue,
            current_index: 0,
            total,
        }
    }

    /// True once every slot in the queue has been consumed.
    pub fn is_finished(&self) -> bool {
        self.current_index >= self.total
    }

    /// Tasks not yet executed.
    pub fn remaining(&self) -> &[Task] {
        &self.queue[self.current_index.min(self.queue.len())..]
    }

    /// Check `0 <= current_index <= total == queue.len()`.
    pub fn validate(&self) -> Result<()> {
        if self.total != self.queue.len() {
            return Err(Error::CorruptCheckpoint(format!(
                "total {} does not match queue length {}",
                self.total,
                self.queue.len()
            )));
        }
        if self.current_index > self.total {
            return Err(Error::CorruptCheckpoint(format!(
                "current index {} is past total {}",
                self.current_index, self.total
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Search Engine
// ---------------------------------------------------------------------------

/// Search engine a task is sent to. Its tag is stored on every record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    #[default]
    Google,
    Bing,
    Duckduckgo,
}

impl SearchEngine {
    fn base_url(self) -> &'static str {
        match self {
            SearchEngine::Google => "https://www.google.com/search",
            SearchEngine::Bing => "https://www.bing.com/search",
            SearchEngine::Duckduckgo => "https://duckduckgo.com/",
        }
    }

    /// Build the locator a worker navigates to for `task`.
    pub fn locator(self, task: &Task) -> std::result::Result<Url, url::ParseError> {
        let mut url = Url::parse(self.base_url())?;
        url.query_pairs_mut().append_pair("q", task.as_str());
        Ok(url)
    }
}

impl std::fmt::Display for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SearchEngine::Google => "google",
            SearchEngine::Bing => "bing",
            SearchEngine::Duckduckgo => "duckduckgo",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SearchEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(SearchEngine::Google),
            "bing" => Ok(SearchEngine::Bing),
            "duckduckgo" => Ok(SearchEngine::Duckduckgo),
            other => Err(Error::Config(format!("unknown search engine: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Executed Record
// ---------------------------------------------------------------------------

/// Append-only log entry for a task that completed without error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedRecord {
    pub task: Task,
    pub timestamp: DateTime<Utc>,
    pub engine: SearchEngine,
}

impl ExecutedRecord {
    pub fn now(task: Task, engine: SearchEngine) -> Self {
        Self {
            task,
            timestamp: Utc::now(),
            engine,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker Handle
// ---------------------------------------------------------------------------

/// Opaque identifier of the external resource a provider hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle(pub u64);

impl std::fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status / Summary
// ---------------------------------------------------------------------------

/// Point-in-time view of the controller and its persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub executing: bool,
    pub cancel_requested: bool,
    pub execution_state: Option<ExecutionState>,
    pub total_executed: usize,
}

/// Outcome of one run, mirrored by the completion event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub records_this_run: usize,
    /// The run reached the end of its queue. Says nothing about failures.
    pub finished: bool,
    pub paused_at_index: Option<usize>,
}
