//! Bounded task execution
//!
//! This module provides:
//! - [`TaskManager`] - Semaphore-bounded executor for named units of work
//! - [`TaskRecord`] - Per-submission bookkeeping (status, outcome, timing)
//! - [`TaskOutcome`] - Tagged success/failure produced by a unit of work
//!
//! A failing unit of work never raises to its submitter; the failure is
//! stored on its record. Only misuse (duplicate live id, submitting after
//! shutdown) is returned as a [`TaskManagerError`].

mod manager;
mod record;

pub use manager::{TaskManager, TaskManagerConfig, TaskManagerError};
pub use record::{TaskOutcome, TaskRecord, TaskStats, TaskStatus};
