//! # probe-engine
//!
//! Resumable, sequential execution of search-query probes.
//!
//! A run walks an ordered list of queries through one reusable worker
//! resource, checkpointing after every query so a stopped or crashed run
//! resumes at the next unexecuted one. Progress and completion go out as
//! best-effort events. Auto mode replays random sessions from a persisted
//! query pool on a schedule.

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod pool;
pub mod store;
pub mod telemetry;
pub mod worker;
