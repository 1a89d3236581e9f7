//! Worker resource management.
//!
//! A run drives every task through one external resource (a browser tab,
//! an HTTP session) supplied by a [`ResourceProvider`]. Creating one per
//! task is expensive and looks nothing like normal use, so the
//! [`WorkerManager`] keeps a single handle alive across tasks and, when
//! settings allow, across runs.
//!
//! The manager only holds a back-reference. Anything outside the engine may
//! destroy the resource at any time; a watcher task clears the reference
//! when that happens and [`WorkerManager::acquire`] probes liveness before
//! reusing it.

pub mod http;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{SearchEngine, Task, WorkerHandle};
use crate::telemetry::metrics;

/// Failures reported by a resource provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("resource creation refused: {0}")]
    Refused(String),

    #[error("no such resource: {0}")]
    NotFound(WorkerHandle),

    #[error("navigation failed: {0}")]
    Navigation(String),
}

/// A single task failed. Recovered by the controller, never fatal to a run.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid locator: {0}")]
    Locator(#[from] url::ParseError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0} was destroyed mid-task")]
    ResourceLost(WorkerHandle),
}

/// Notifications a provider broadcasts about its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    /// The resource finished loading its current locator.
    Loaded(WorkerHandle),
    /// The resource is gone, whoever destroyed it.
    Destroyed(WorkerHandle),
}

/// The host environment's resource API.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create(&self, locator: &str) -> std::result::Result<WorkerHandle, ProviderError>;

    async fn navigate(
        &self,
        handle: WorkerHandle,
        locator: &str,
    ) -> std::result::Result<(), ProviderError>;

    async fn destroy(&self, handle: WorkerHandle) -> std::result::Result<(), ProviderError>;

    async fn is_alive(&self, handle: WorkerHandle) -> bool;

    /// Subscribe to load and destruction events for every resource.
    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent>;
}

/// Timing of a single task.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Locator a freshly created resource starts on.
    pub blank_locator: String,
    /// Safety timeout racing the completion signal.
    pub load_timeout: Duration,
    /// Hold after a completed load before the task counts as done.
    pub dwell: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            blank_locator: "about:blank".to_string(),
            load_timeout: Duration::from_secs(15),
            dwell: Duration::from_secs(2),
        }
    }
}

/// How the completion race settled.
enum Settled {
    Loaded,
    TimedOut,
    Destroyed,
}

/// Mediates the single reusable resource.
pub struct WorkerManager {
    provider: Arc<dyn ResourceProvider>,
    current: Arc<Mutex<Option<WorkerHandle>>>,
    config: WorkerConfig,
    watcher: JoinHandle<()>,
}

impl WorkerManager {
    /// Create a manager and start its destruction watcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(provider: Arc<dyn ResourceProvider>, config: WorkerConfig) -> Self {
        let current = Arc::new(Mutex::new(None));
        let watcher = tokio::spawn(watch_destruction(
            provider.subscribe(),
            Arc::clone(&current),
        ));
        Self {
            provider,
            current,
            config,
            watcher,
        }
    }

    /// The handle currently held, if any.
    pub async fn current(&self) -> Option<WorkerHandle> {
        *self.current.lock().await
    }

    /// Reuse the held resource if it is still alive, otherwise create one.
    pub async fn acquire(&self) -> Result<WorkerHandle> {
        let existing = *self.current.lock().await;
        if let Some(handle) = existing {
            if self.provider.is_alive(handle).await {
                debug!(%handle, "reusing worker");
                metrics::worker_acquisitions().add(1, &[KeyValue::new("result", "reused")]);
                return Ok(handle);
            }
            warn!(%handle, "held worker was destroyed externally");
            self.forget(handle).await;
        }

        let handle = match self.provider.create(&self.config.blank_locator).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "worker creation failed");
                metrics::worker_acquisitions().add(1, &[KeyValue::new("result", "error")]);
                return Err(Error::Acquisition(e));
            }
        };
        *self.current.lock().await = Some(handle);
        info!(%handle, "worker created");
        metrics::worker_acquisitions().add(1, &[KeyValue::new("result", "created")]);
        Ok(handle)
    }

    /// Point the resource at the task's locator and wait for it to load.
    ///
    /// Races the provider's load signal against the safety timeout. A load
    /// holds the resource for the dwell period; a timeout returns at once.
    /// Either counts as success. Losing the resource mid-task is an error.
    pub async fn run_task(
        &self,
        handle: WorkerHandle,
        task: &Task,
        engine: SearchEngine,
    ) -> std::result::Result<(), TaskError> {
        let locator = engine.locator(task)?;
        // Subscribe before navigating so a fast load cannot be missed.
        let mut events = self.provider.subscribe();
        self.provider.navigate(handle, locator.as_str()).await?;

        let settled = tokio::select! {
            settled = wait_for_load(&mut events, handle) => settled,
            _ = tokio::time::sleep(self.config.load_timeout) => Settled::TimedOut,
        };
        drop(events);

        match settled {
            Settled::Loaded => {
                tokio::time::sleep(self.config.dwell).await;
                Ok(())
            }
            Settled::TimedOut => {
                warn!(
                    %handle,
                    timeout_ms = self.config.load_timeout.as_millis() as u64,
                    "no load signal before timeout, moving on"
                );
                Ok(())
            }
            Settled::Destroyed => Err(TaskError::ResourceLost(handle)),
        }
    }

    /// End the run's use of `handle`: destroy it or keep it for reuse.
    ///
    /// Destruction failures are logged and otherwise ignored.
    pub async fn release(&self, handle: WorkerHandle, destroy: bool) {
        if !destroy {
            debug!(%handle, "keeping worker for reuse");
            return;
        }
        self.forget(handle).await;
        self.destroy(handle).await;
    }

    /// Destroy whatever resource is held right now.
    pub async fn release_current(&self) {
        let taken = self.current.lock().await.take();
        if let Some(handle) = taken {
            self.destroy(handle).await;
        }
    }

    async fn destroy(&self, handle: WorkerHandle) {
        match self.provider.destroy(handle).await {
            Ok(()) => debug!(%handle, "worker destroyed"),
            Err(ProviderError::NotFound(_)) => debug!(%handle, "worker already gone"),
            Err(e) => warn!(%handle, error = %e, "worker destroy failed"),
        }
    }

    /// Clear the stored reference if it still points at `handle`.
    async fn forget(&self, handle: WorkerHandle) {
        let mut current = self.current.lock().await;
        if *current == Some(handle) {
            *current = None;
        }
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn wait_for_load(
    events: &mut broadcast::Receiver<ResourceEvent>,
    handle: WorkerHandle,
) -> Settled {
    loop {
        match events.recv().await {
            Ok(ResourceEvent::Loaded(h)) if h == handle => return Settled::Loaded,
            Ok(ResourceEvent::Destroyed(h)) if h == handle => return Settled::Destroyed,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "resource events lagged"),
            // Provider went away: leave it to the timeout.
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}

/// Clear the held reference whenever the provider reports it destroyed.
async fn watch_destruction(
    mut events: broadcast::Receiver<ResourceEvent>,
    current: Arc<Mutex<Option<WorkerHandle>>>,
) {
    loop {
        match events.recv().await {
            Ok(ResourceEvent::Destroyed(handle)) => {
                let mut held = current.lock().await;
                if *held == Some(handle) {
                    *held = None;
                    info!(%handle, "held worker destroyed, reference cleared");
                }
            }
            Ok(ResourceEvent::Loaded(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "destruction watcher lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
