//! Execution controller: starts, stops and resumes runs.
//!
//! A run walks its queue strictly in order through one worker handle,
//! checkpointing after every task. Only one run is active per process;
//! `start` and `resume` fail with [`Error::Busy`] while it is. `stop` is
//! cooperative: it is seen between tasks and during the inter-task delay,
//! never in the middle of a task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::settings::{Settings, SettingsProvider};
use crate::error::{Error, Result};
use crate::event::{Event, Notifier};
use crate::model::{ExecutedRecord, ExecutionState, RunStatus, RunSummary, Task, WorkerHandle};
use crate::store::keys;
use crate::telemetry::metrics;
use crate::telemetry::run::{record_run_transition, start_run_span};
use crate::worker::WorkerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Start,
    Resume,
}

impl RunKind {
    fn as_str(self) -> &'static str {
        match self {
            RunKind::Start => "start",
            RunKind::Resume => "resume",
        }
    }
}

/// Process-local run flags. Never persisted.
#[derive(Default)]
struct RunFlags {
    executing: AtomicBool,
    /// Replaced with a fresh token whenever a run begins or ends, so a
    /// cancelled token means "stop requested since then".
    cancel: Mutex<CancellationToken>,
}

impl RunFlags {
    /// Claim the single run slot and hand out the run's cancellation token.
    fn begin(&self) -> Result<CancellationToken> {
        let mut cancel = lock(&self.cancel);
        if self
            .executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy);
        }
        *cancel = CancellationToken::new();
        Ok(cancel.clone())
    }

    fn finish(&self) {
        let mut cancel = lock(&self.cancel);
        *cancel = CancellationToken::new();
        self.executing.store(false, Ordering::SeqCst);
    }

    /// Cancel the current token. Returns whether a run is active.
    fn request_cancel(&self) -> bool {
        let cancel = lock(&self.cancel);
        cancel.cancel();
        self.executing.load(Ordering::SeqCst)
    }

    fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    fn cancel_requested(&self) -> bool {
        lock(&self.cancel).is_cancelled()
    }
}

/// Releases the run slot on every exit path, including early errors.
struct RunGuard<'a> {
    flags: &'a RunFlags,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flags.finish();
    }
}

/// The run/stop/resume state machine.
#[derive(Clone)]
pub struct ExecutionController {
    checkpoints: CheckpointStore,
    workers: Arc<WorkerManager>,
    notifier: Arc<Notifier>,
    settings: Arc<dyn SettingsProvider>,
    flags: Arc<RunFlags>,
}

impl ExecutionController {
    pub fn new(
        checkpoints: CheckpointStore,
        workers: Arc<WorkerManager>,
        notifier: Arc<Notifier>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            checkpoints,
            workers,
            notifier,
            settings,
            flags: Arc::new(RunFlags::default()),
        }
    }

    /// Listen for progress and completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.notifier.subscribe()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn settings(&self) -> &Arc<dyn SettingsProvider> {
        &self.settings
    }

    pub fn is_executing(&self) -> bool {
        self.flags.is_executing()
    }

    /// Run `tasks` from the first one, replacing any paused checkpoint.
    ///
    /// Returns once the run has finished or paused.
    pub async fn start(&self, tasks: Vec<Task>) -> Result<RunSummary> {
        let cancel = self.flags.begin()?;
        let guard = RunGuard { flags: &self.flags };
        info!(total = tasks.len(), "starting run");
        self.run(RunKind::Start, ExecutionState::new(tasks), cancel, guard)
            .await
    }

    /// Continue the persisted run at its checkpointed index.
    pub async fn resume(&self) -> Result<RunSummary> {
        if self.flags.is_executing() {
            return Err(Error::Busy);
        }
        let state = match self.checkpoints.read_execution_state().await? {
            Some(state) if !state.is_finished() => state,
            Some(_) => {
                // Crashed between the last task and the final cleanup.
                debug!("discarding finished checkpoint");
                self.checkpoints.write_execution_state(None).await?;
                return Err(Error::NoPendingRun);
            }
            None => return Err(Error::NoPendingRun),
        };

        let cancel = self.flags.begin()?;
        let guard = RunGuard { flags: &self.flags };
        info!(
            current_index = state.current_index,
            total = state.total,
            "resuming run"
        );
        self.run(RunKind::Resume, state, cancel, guard).await
    }

    /// Request the active run to pause. Idempotent; a no-op while idle
    /// apart from the flag, which the next `start`/`resume` clears.
    ///
    /// The worker is released immediately, abandoning any in-flight task.
    pub async fn stop(&self) {
        if self.flags.request_cancel() {
            info!("stop requested, releasing worker");
            self.workers.release_current().await;
        } else {
            debug!("stop requested while idle");
        }
    }

    /// Snapshot of the flags and persisted state. No side effects.
    pub async fn status(&self) -> Result<RunStatus> {
        Ok(RunStatus {
            executing: self.flags.is_executing(),
            cancel_requested: self.flags.cancel_requested(),
            execution_state: self.checkpoints.read_execution_state().await?,
            total_executed: self.checkpoints.executed_count().await?,
        })
    }

    /// Wipe every persisted key and reinstate empty logs and default
    /// settings. Refused while a run is active.
    pub async fn clear_all_data(&self) -> Result<()> {
        if self.flags.is_executing() {
            return Err(Error::Busy);
        }
        let store = self.checkpoints.store();
        store.clear().await?;
        store
            .set(keys::EXECUTED_QUERIES, serde_json::Value::Array(Vec::new()))
            .await?;
        store
            .set(keys::SELECTED_QUERIES, serde_json::Value::Array(Vec::new()))
            .await?;
        store
            .set(keys::SETTINGS, serde_json::to_value(Settings::default())?)
            .await?;
        info!("all data cleared");
        Ok(())
    }

    async fn run(
        &self,
        kind: RunKind,
        mut state: ExecutionState,
        cancel: CancellationToken,
        guard: RunGuard<'_>,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = start_run_span(kind.as_str(), &run_id, state.total, state.current_index);
        self.run_in_span(kind, run_id, &mut state, cancel, guard, &span)
            .instrument(span.clone())
            .await
    }

    async fn run_in_span(
        &self,
        kind: RunKind,
        run_id: Uuid,
        state: &mut ExecutionState,
        cancel: CancellationToken,
        guard: RunGuard<'_>,
        span: &Span,
    ) -> Result<RunSummary> {
        let settings = self.settings.load().await?;

        if state.is_finished() {
            // Empty queue: nothing to acquire, nothing to keep.
            self.checkpoints.write_execution_state(None).await?;
            drop(guard);
            self.notifier.publish_completion(0, true, None);
            return Ok(RunSummary {
                run_id,
                records_this_run: 0,
                finished: true,
                paused_at_index: None,
            });
        }

        let handle = self.workers.acquire().await?;
        record_run_transition(span, "idle", "running");

        let mut records = Vec::new();
        let driven = self
            .drive(state, handle, &settings, &cancel, &mut records)
            .await;

        self.workers
            .release(handle, settings.close_resource_on_completion)
            .await;
        let appended = self.checkpoints.append_records(&records).await;
        driven?;
        appended?;

        let finished = state.is_finished();
        if finished {
            self.checkpoints.write_execution_state(None).await?;
            record_run_transition(span, "running", "finished");
        } else {
            record_run_transition(span, "running", "paused");
        }
        drop(guard);

        let paused_at_index = (!finished).then_some(state.current_index);
        metrics::runs_ended().add(
            1,
            &[
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("outcome", if finished { "finished" } else { "paused" }),
            ],
        );
        self.notifier
            .publish_completion(records.len(), finished, paused_at_index);
        info!(
            records = records.len(),
            finished,
            current_index = state.current_index,
            total = state.total,
            "run ended"
        );

        Ok(RunSummary {
            run_id,
            records_this_run: records.len(),
            finished,
            paused_at_index,
        })
    }

    /// The task loop. Checkpoints after every slot; stops at the first
    /// boundary after cancellation.
    async fn drive(
        &self,
        state: &mut ExecutionState,
        handle: WorkerHandle,
        settings: &Settings,
        cancel: &CancellationToken,
        records: &mut Vec<ExecutedRecord>,
    ) -> Result<()> {
        let engine = settings.search_engine;
        let labels = [KeyValue::new("engine", engine.to_string())];
        self.checkpoints.write_execution_state(Some(&*state)).await?;

        for i in state.current_index..state.total {
            if cancel.is_cancelled() {
                state.current_index = i;
                self.checkpoints.write_execution_state(Some(&*state)).await?;
                info!(paused_at = i, "run paused");
                break;
            }

            let task = state.queue[i].clone();
            let started = Instant::now();
            let result = self.workers.run_task(handle, &task, engine).await;
            metrics::probe_duration_ms()
                .record(started.elapsed().as_secs_f64() * 1000.0, &labels);

            match result {
                Ok(()) => {
                    debug!(index = i, %task, "task done");
                    metrics::probes_executed().add(
                        1,
                        &[
                            KeyValue::new("engine", engine.to_string()),
                            KeyValue::new("result", "ok"),
                        ],
                    );
                    records.push(ExecutedRecord::now(task, engine));
                }
                Err(e) => {
                    warn!(index = i, %task, error = %e, "task failed");
                    metrics::probes_executed().add(
                        1,
                        &[
                            KeyValue::new("engine", engine.to_string()),
                            KeyValue::new("result", "error"),
                        ],
                    );
                }
            }

            state.current_index = i + 1;
            self.checkpoints.write_execution_state(Some(&*state)).await?;
            self.notifier.publish_progress(state.current_index, state.total);

            if i + 1 < state.total && !cancel.is_cancelled() {
                pause(settings.delay_between_queries(), cancel).await;
            }
        }
        Ok(())
    }
}

/// Inter-task delay, cut short by cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => debug!("delay cut short by stop"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
