//! Run orchestration: the execution controller and auto mode on top of it.

pub mod auto;
pub mod control;

pub use auto::{AutoPilot, AutoStatus};
pub use control::ExecutionController;
