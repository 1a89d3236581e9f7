//! Auto mode: periodic sessions drawn from the selected-query pool.
//!
//! A session runs as soon as auto mode is enabled and then once every
//! `auto_mode_interval`. Sessions never overlap with another run: if the
//! controller is busy the tick is skipped, not queued.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use super::control::ExecutionController;
use crate::error::{Error, Result};
use crate::model::{RunStatus, RunSummary};
use crate::pool::QueryPool;
use crate::store::keys;

/// Run status plus the auto-mode view of the store.
#[derive(Debug, Clone, Serialize)]
pub struct AutoStatus {
    #[serde(flatten)]
    pub run: RunStatus,
    pub auto_mode: bool,
    pub total_selected: usize,
}

struct Schedule {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the auto-mode schedule.
pub struct AutoPilot {
    controller: ExecutionController,
    pool: QueryPool,
    schedule: Mutex<Option<Schedule>>,
}

impl AutoPilot {
    pub fn new(controller: ExecutionController, pool: QueryPool) -> Self {
        Self {
            controller,
            pool,
            schedule: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &QueryPool {
        &self.pool
    }

    /// Persisted auto-mode flag.
    pub async fn is_enabled(&self) -> Result<bool> {
        let value = self.controller.checkpoints().store().get(keys::AUTO_MODE).await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Persist the auto-mode flag without touching the schedule.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.controller
            .checkpoints()
            .store()
            .set(keys::AUTO_MODE, serde_json::Value::Bool(enabled))
            .await
    }

    /// Persist the flag and start the schedule. The first session runs
    /// immediately in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn enable(&self) -> Result<()> {
        self.set_enabled(true).await?;
        self.spawn_schedule();
        Ok(())
    }

    /// Persist the flag and stop the schedule. A session already running is
    /// left to finish; use the controller's `stop` to pause it.
    pub async fn disable(&self) -> Result<()> {
        self.set_enabled(false).await?;
        if self.shutdown() {
            info!("auto mode disabled");
        }
        Ok(())
    }

    /// Stop the schedule but keep the persisted flag, so `restore` picks it
    /// up again next time. Returns whether a schedule was running.
    pub fn shutdown(&self) -> bool {
        match lock(&self.schedule).take() {
            Some(schedule) => {
                schedule.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Restart the schedule after a process restart if the flag is set.
    /// Returns whether auto mode is on.
    pub async fn restore(&self) -> Result<bool> {
        let enabled = self.is_enabled().await?;
        if enabled {
            self.spawn_schedule();
        }
        Ok(enabled)
    }

    /// True while a schedule task is alive.
    pub fn is_scheduled(&self) -> bool {
        lock(&self.schedule)
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Run one session now. Returns `None` when the tick was skipped.
    pub async fn run_session(&self) -> Result<Option<RunSummary>> {
        run_session(&self.controller, &self.pool).await
    }

    pub async fn status(&self) -> Result<AutoStatus> {
        Ok(AutoStatus {
            run: self.controller.status().await?,
            auto_mode: self.is_enabled().await?,
            total_selected: self.pool.len().await?,
        })
    }

    fn spawn_schedule(&self) {
        let mut schedule = lock(&self.schedule);
        if schedule.as_ref().is_some_and(|s| !s.task.is_finished()) {
            debug!("auto mode already scheduled");
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            schedule_loop(self.controller.clone(), self.pool.clone(), cancel.clone())
                .instrument(info_span!("auto_mode")),
        );
        *schedule = Some(Schedule { cancel, task });
        info!("auto mode enabled");
    }
}

impl Drop for AutoPilot {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn schedule_loop(
    controller: ExecutionController,
    pool: QueryPool,
    cancel: CancellationToken,
) {
    loop {
        if let Err(e) = run_session(&controller, &pool).await {
            error!(error = %e, "auto session failed");
        }

        let interval = match controller.settings().load().await {
            Ok(settings) => settings.auto_mode_interval(),
            Err(e) => {
                error!(error = %e, "cannot load settings, auto mode stopping");
                return;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("auto schedule cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn run_session(
    controller: &ExecutionController,
    pool: &QueryPool,
) -> Result<Option<RunSummary>> {
    if controller.is_executing() {
        info!("run in progress, skipping auto session");
        return Ok(None);
    }

    let pending = controller
        .checkpoints()
        .read_execution_state()
        .await?
        .is_some_and(|state| !state.is_finished());
    let outcome = if pending {
        info!("resuming paused run for auto session");
        controller.resume().await
    } else {
        let mut tasks = pool.list().await?;
        if tasks.is_empty() {
            info!("no queries selected, skipping auto session");
            return Ok(None);
        }
        let settings = controller.settings().load().await?;
        tasks.shuffle(&mut rand::rng());
        tasks.truncate(settings.queries_per_session);
        info!(queries = tasks.len(), "starting auto session");
        controller.start(tasks).await
    };

    match outcome {
        Ok(summary) => Ok(Some(summary)),
        Err(Error::Busy) => {
            info!("run started concurrently, skipping auto session");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
