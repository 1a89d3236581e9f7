//! Execution controller tests against the simulated provider.
//!
//! Time is paused, so delays and load latencies cost nothing but still
//! order events the way they would in real time.

use std::sync::Arc;
use std::time::Duration;

use probe_engine::checkpoint::CheckpointStore;
use probe_engine::config::settings::Settings;
use probe_engine::engine::ExecutionController;
use probe_engine::error::Error;
use probe_engine::event::{EventKind, Notifier};
use probe_engine::model::{ExecutionState, SearchEngine, Task};
use probe_engine::store::{DurableStore, MemoryStore, keys};
use probe_engine::worker::simulated::SimulatedProvider;
use probe_engine::worker::{WorkerConfig, WorkerManager};
use serde_json::json;
use tokio::time::Instant;

struct Harness {
    provider: Arc<SimulatedProvider>,
    store: Arc<MemoryStore>,
    workers: Arc<WorkerManager>,
    controller: ExecutionController,
}

fn no_delay() -> Settings {
    Settings {
        delay_between_queries_ms: 0,
        ..Settings::default()
    }
}

fn harness(settings: Settings) -> Harness {
    harness_on(Arc::new(MemoryStore::new()), settings)
}

fn harness_on(store: Arc<MemoryStore>, settings: Settings) -> Harness {
    harness_with(store, Arc::new(SimulatedProvider::new()), settings)
}

fn harness_with(
    store: Arc<MemoryStore>,
    provider: Arc<SimulatedProvider>,
    settings: Settings,
) -> Harness {
    let workers = Arc::new(WorkerManager::new(
        provider.clone(),
        WorkerConfig {
            dwell: Duration::from_millis(100),
            ..WorkerConfig::default()
        },
    ));
    let controller = ExecutionController::new(
        CheckpointStore::new(store.clone()),
        workers.clone(),
        Arc::new(Notifier::new()),
        Arc::new(settings),
    );
    Harness {
        provider,
        store,
        workers,
        controller,
    }
}

fn tasks(queries: &[&str]) -> Vec<Task> {
    queries.iter().copied().map(Task::from).collect()
}

async fn checkpoint(h: &Harness) -> Option<ExecutionState> {
    h.controller.checkpoints().read_execution_state().await.unwrap()
}

/// Stop the controller after `after` has elapsed.
fn stop_after(controller: &ExecutionController, after: Duration) {
    let controller = controller.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        controller.stop().await;
    });
}

#[tokio::test(start_paused = true)]
async fn run_executes_every_task_in_order() {
    let h = harness(no_delay());
    let mut events = h.controller.subscribe();

    let summary = h.controller.start(tasks(&["a", "b", "c"])).await.unwrap();
    assert!(summary.finished);
    assert_eq!(summary.records_this_run, 3);
    assert_eq!(summary.paused_at_index, None);

    assert_eq!(h.provider.queries(), ["a", "b", "c"]);
    let records = h.controller.checkpoints().executed_records().await.unwrap();
    let executed: Vec<&str> = records.iter().map(|r| r.task.as_str()).collect();
    assert_eq!(executed, ["a", "b", "c"]);
    assert!(records.iter().all(|r| r.engine == SearchEngine::Google));

    // Finished runs leave no checkpoint and, by default, no resource.
    let status = h.controller.status().await.unwrap();
    assert!(!status.executing);
    assert_eq!(status.execution_state, None);
    assert_eq!(status.total_executed, 3);
    assert_eq!(h.provider.live_count(), 0);

    let mut kinds = Vec::new();
    let mut last_seq = None;
    while let Ok(event) = events.try_recv() {
        if let Some(prev) = last_seq {
            assert!(event.seq > prev);
        }
        last_seq = Some(event.seq);
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![
            EventKind::Progress { current: 1, total: 3 },
            EventKind::Progress { current: 2, total: 3 },
            EventKind::Progress { current: 3, total: 3 },
            EventKind::Complete {
                records_this_run: 3,
                finished: true,
                paused_at_index: None,
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_pauses_at_boundary_and_resume_continues() {
    let h = harness(Settings {
        delay_between_queries_ms: 1000,
        ..Settings::default()
    });

    // Stop once the second task is committed, during the inter-task delay.
    let mut events = h.controller.subscribe();
    let stopper = h.controller.clone();
    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.kind == (EventKind::Progress { current: 2, total: 5 }) {
                stopper.stop().await;
                break;
            }
        }
    });

    let summary = h
        .controller
        .start(tasks(&["a", "b", "c", "d", "e"]))
        .await
        .unwrap();
    listener.await.unwrap();

    assert!(!summary.finished);
    assert_eq!(summary.records_this_run, 2);
    assert_eq!(summary.paused_at_index, Some(2));
    assert_eq!(h.provider.queries(), ["a", "b"]);

    let status = h.controller.status().await.unwrap();
    assert!(!status.executing);
    assert!(!status.cancel_requested);
    let state = status.execution_state.unwrap();
    assert_eq!(state.current_index, 2);
    assert_eq!(state.total, 5);
    assert_eq!(state.remaining(), tasks(&["c", "d", "e"]).as_slice());

    let summary = h.controller.resume().await.unwrap();
    assert!(summary.finished);
    assert_eq!(summary.records_this_run, 3);
    assert_eq!(h.provider.queries(), ["a", "b", "c", "d", "e"]);
    assert_eq!(h.controller.checkpoints().executed_count().await.unwrap(), 5);
    assert_eq!(checkpoint(&h).await, None);
}

#[tokio::test(start_paused = true)]
async fn stop_cuts_the_delay_short() {
    let h = harness(Settings {
        delay_between_queries_ms: 600_000,
        ..Settings::default()
    });
    stop_after(&h.controller, Duration::from_secs(10));

    let started = Instant::now();
    let summary = h.controller.start(tasks(&["a", "b"])).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(11), "{elapsed:?}");
    assert!(!summary.finished);
    assert_eq!(summary.records_this_run, 1);
    assert_eq!(summary.paused_at_index, Some(1));
    assert_eq!(checkpoint(&h).await.map(|s| s.current_index), Some(1));
}

#[tokio::test(start_paused = true)]
async fn stop_abandons_the_in_flight_task() {
    // Loads never signal, so only the 15s timeout would end a task.
    let h = harness_with(
        Arc::new(MemoryStore::new()),
        Arc::new(SimulatedProvider::with_load_latency(None)),
        no_delay(),
    );
    stop_after(&h.controller, Duration::from_secs(1));

    let started = Instant::now();
    let summary = h.controller.start(tasks(&["a", "b"])).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(15), "{elapsed:?}");
    assert!(!summary.finished);
    assert_eq!(summary.records_this_run, 0);
    assert_eq!(summary.paused_at_index, Some(1));
    assert_eq!(checkpoint(&h).await.map(|s| s.current_index), Some(1));
    assert_eq!(h.provider.live_count(), 0);
    assert_eq!(h.provider.queries(), ["a"]);
}

#[tokio::test(start_paused = true)]
async fn failed_task_is_skipped_not_retried() {
    let h = harness(no_delay());
    h.provider.fail_query("b");

    let summary = h.controller.start(tasks(&["a", "b", "c"])).await.unwrap();
    assert!(summary.finished);
    assert_eq!(summary.records_this_run, 2);

    let records = h.controller.checkpoints().executed_records().await.unwrap();
    let executed: Vec<&str> = records.iter().map(|r| r.task.as_str()).collect();
    assert_eq!(executed, ["a", "c"]);
    assert_eq!(h.provider.queries(), ["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn second_run_is_refused_while_busy() {
    let h = harness(Settings {
        delay_between_queries_ms: 1000,
        ..Settings::default()
    });

    let controller = h.controller.clone();
    let run = tokio::spawn(async move { controller.start(tasks(&["a", "b", "c"])).await });
    while !h.controller.is_executing() {
        tokio::task::yield_now().await;
    }

    assert!(matches!(h.controller.start(tasks(&["x"])).await, Err(Error::Busy)));
    assert!(matches!(h.controller.resume().await, Err(Error::Busy)));
    assert!(matches!(h.controller.clear_all_data().await, Err(Error::Busy)));

    let summary = run.await.unwrap().unwrap();
    assert!(summary.finished);
    assert_eq!(h.provider.queries(), ["a", "b", "c"]);
    assert!(!h.controller.is_executing());
}

#[tokio::test(start_paused = true)]
async fn resume_without_checkpoint_is_an_error() {
    let h = harness(no_delay());
    assert!(matches!(h.controller.resume().await, Err(Error::NoPendingRun)));
    assert!(!h.controller.is_executing());
}

#[tokio::test(start_paused = true)]
async fn resume_discards_finished_checkpoint() {
    let h = harness(no_delay());
    let mut state = ExecutionState::new(tasks(&["a", "b"]));
    state.current_index = 2;
    h.controller
        .checkpoints()
        .write_execution_state(Some(&state))
        .await
        .unwrap();

    assert!(matches!(h.controller.resume().await, Err(Error::NoPendingRun)));
    assert_eq!(checkpoint(&h).await, None);
    assert!(h.provider.navigations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn corrupt_checkpoint_is_reported() {
    let h = harness(no_delay());
    h.store
        .set(
            keys::EXECUTION_STATE,
            json!({ "queue": ["a", "b"], "current_index": 5, "total": 2 }),
        )
        .await
        .unwrap();

    assert!(matches!(
        h.controller.resume().await,
        Err(Error::CorruptCheckpoint(_))
    ));
    assert!(!h.controller.is_executing());
}

#[tokio::test(start_paused = true)]
async fn acquisition_failure_leaves_state_untouched() {
    let h = harness(no_delay());
    let mut paused = ExecutionState::new(tasks(&["a", "b", "c"]));
    paused.current_index = 1;
    h.controller
        .checkpoints()
        .write_execution_state(Some(&paused))
        .await
        .unwrap();

    h.provider.refuse_create(true);
    assert!(matches!(
        h.controller.start(tasks(&["x", "y"])).await,
        Err(Error::Acquisition(_))
    ));
    assert!(!h.controller.is_executing());
    assert_eq!(checkpoint(&h).await, Some(paused));

    h.provider.refuse_create(false);
    let summary = h.controller.resume().await.unwrap();
    assert!(summary.finished);
    assert_eq!(h.provider.queries(), ["b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn empty_run_finishes_without_a_resource() {
    let h = harness(no_delay());
    let mut events = h.controller.subscribe();

    let summary = h.controller.start(Vec::new()).await.unwrap();
    assert!(summary.finished);
    assert_eq!(summary.records_this_run, 0);
    assert_eq!(h.provider.created(), 0);
    assert_eq!(
        events.try_recv().unwrap().kind,
        EventKind::Complete {
            records_this_run: 0,
            finished: true,
            paused_at_index: None,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn stop_while_idle_does_not_affect_next_run() {
    let h = harness(no_delay());
    h.controller.stop().await;
    h.controller.stop().await;
    assert!(h.controller.status().await.unwrap().cancel_requested);

    let summary = h.controller.start(tasks(&["a", "b"])).await.unwrap();
    assert!(summary.finished);
    assert_eq!(summary.records_this_run, 2);
    assert!(!h.controller.status().await.unwrap().cancel_requested);
}

#[tokio::test(start_paused = true)]
async fn resource_is_kept_across_runs_when_configured() {
    let h = harness(Settings {
        close_resource_on_completion: false,
        ..no_delay()
    });

    h.controller.start(tasks(&["a"])).await.unwrap();
    let first = h.workers.current().await.unwrap();
    h.controller.start(tasks(&["b"])).await.unwrap();

    assert_eq!(h.provider.created(), 1);
    assert_eq!(h.workers.current().await, Some(first));
    assert_eq!(h.provider.live_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn externally_destroyed_resource_is_replaced() {
    let h = harness(Settings {
        close_resource_on_completion: false,
        ..no_delay()
    });

    h.controller.start(tasks(&["a"])).await.unwrap();
    let first = h.workers.current().await.unwrap();
    h.provider.destroy_externally(first);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.workers.current().await, None);

    let summary = h.controller.start(tasks(&["b"])).await.unwrap();
    assert_eq!(summary.records_this_run, 1);
    assert_eq!(h.provider.created(), 2);
    assert_ne!(h.workers.current().await, Some(first));
}

#[tokio::test(start_paused = true)]
async fn new_controller_resumes_after_crash() {
    let store = Arc::new(MemoryStore::new());
    let mut state = ExecutionState::new(tasks(&["a", "b", "c"]));
    state.current_index = 1;
    CheckpointStore::new(store.clone())
        .write_execution_state(Some(&state))
        .await
        .unwrap();

    let h = harness_on(store, no_delay());
    let status = h.controller.status().await.unwrap();
    assert!(!status.executing);
    assert_eq!(status.execution_state.unwrap().current_index, 1);

    let summary = h.controller.resume().await.unwrap();
    assert!(summary.finished);
    assert_eq!(summary.records_this_run, 2);
    assert_eq!(h.provider.queries(), ["b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn clear_all_data_restores_defaults() {
    let h = harness(no_delay());
    h.controller.start(tasks(&["a", "b"])).await.unwrap();
    h.store
        .set(keys::SELECTED_QUERIES, json!(["x", "y"]))
        .await
        .unwrap();
    h.store.set(keys::AUTO_MODE, json!(true)).await.unwrap();

    h.controller.clear_all_data().await.unwrap();

    assert_eq!(h.controller.checkpoints().executed_count().await.unwrap(), 0);
    assert_eq!(
        h.store.get(keys::SELECTED_QUERIES).await.unwrap(),
        Some(json!([]))
    );
    assert_eq!(h.store.get(keys::AUTO_MODE).await.unwrap(), None);
    let settings: Settings =
        serde_json::from_value(h.store.get(keys::SETTINGS).await.unwrap().unwrap()).unwrap();
    assert_eq!(settings, Settings::default());
}
