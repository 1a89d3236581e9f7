//! Metric instrument factories for probe-engine.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("probe-engine")
}

/// Counter: tasks executed.
/// Labels: `engine`, `result` ("ok" | "error").
pub fn probes_executed() -> Counter<u64> {
    meter()
        .u64_counter("probe.tasks.executed")
        .with_description("Number of probe tasks executed")
        .build()
}

/// Histogram: time spent in a single task, including the dwell.
/// Labels: `engine`.
pub fn probe_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("probe.task.duration_ms")
        .with_description("Probe task duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: runs that ended.
/// Labels: `kind` ("start" | "resume"), `outcome` ("finished" | "paused").
pub fn runs_ended() -> Counter<u64> {
    meter()
        .u64_counter("probe.runs.ended")
        .with_description("Number of runs that reached the end or paused")
        .build()
}

/// Counter: worker acquisitions.
/// Labels: `result` ("reused" | "created" | "error").
pub fn worker_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("probe.worker.acquisitions")
        .with_description("Worker resource acquisitions")
        .build()
}
