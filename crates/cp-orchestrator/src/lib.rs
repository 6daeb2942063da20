//! The run-orchestrator: binds the Queue, State Machine,
//! Scheduler, Sandbox Pool, and Billing Ledger into the control-flow loop
//! that takes a run from `created` through to a terminal state, and the
//! two sidecar loops (queue reconciliation, deadline sweep) that keep it
//! self-healing.
//!
//! This crate owns no state of its own beyond an in-process map of
//! which sandbox a running subtask currently holds — everything else is
//! delegated to the ports it binds together.

pub mod driver;
pub mod error;
pub mod reconciler;
pub mod types;

pub use driver::RunDriver;
pub use error::{OrchestratorError, Result};
pub use reconciler::{DriverLoops, ReconcilerConfig, spawn_driver_loops};
pub use types::{DriverConfig, NewSubtask, TokenUsage};
