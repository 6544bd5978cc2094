//! Task records and status transitions

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serde_helpers::option_duration_millis;

/// Task lifecycle status
///
/// ```text
/// ┌─────────┐     ┌─────────┐     ┌───────────┐
/// │ Pending │ ──► │ Running │ ──► │ Completed │
/// └─────────┘     └─────────┘  │  └───────────┘
///                              │  ┌───────────┐
///                              └► │  Failed   │
///                                 └───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered, waiting for an admission slot
    Pending,

    /// Holding a slot and executing
    Running,

    /// Finished with a result
    Completed,

    /// Finished with an error
    Failed,
}

impl TaskStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the lifecycle
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Tagged outcome of a unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

impl TaskOutcome {
    /// Build an outcome from a unit-of-work result
    pub fn from_result<E: std::fmt::Display>(result: Result<serde_json::Value, E>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    fn status(&self) -> TaskStatus {
        match self {
            Self::Completed(_) => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Failed,
        }
    }
}

/// Bookkeeping for one submitted unit of work
///
/// Only the [`TaskManager`](super::TaskManager) mutates a record. `result` is
/// set only for completed records and `error` only for failed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "duration_ms", with = "option_duration_millis")]
    pub duration: Option<Duration>,
}

impl TaskRecord {
    pub(crate) fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration: None,
        }
    }

    /// Pending → Running. Returns false if the record is not pending.
    pub(crate) fn mark_running(&mut self) -> bool {
        if !self.status.can_transition_to(TaskStatus::Running) {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Running → terminal. Returns false if the record is not running.
    pub(crate) fn finish(&mut self, outcome: TaskOutcome, elapsed: Duration) -> bool {
        let next = outcome.status();
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match outcome {
            TaskOutcome::Completed(value) => self.result = Some(value),
            TaskOutcome::Failed(error) => self.error = Some(error),
        }
        self.ended_at = Some(Utc::now());
        self.duration = Some(elapsed);
        true
    }

    /// Whether the record reached a final state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The outcome of a terminal record
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.status {
            TaskStatus::Completed => Some(TaskOutcome::Completed(
                self.result.clone().unwrap_or(serde_json::Value::Null),
            )),
            TaskStatus::Failed => Some(TaskOutcome::Failed(self.error.clone().unwrap_or_default())),
            TaskStatus::Pending | TaskStatus::Running => None,
        }
    }
}

/// Per-status counts over the results table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskStats {
    pub(crate) fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    /// Total number of records
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));

        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::Running.to_string(), "running");
        assert_eq!(TaskStatus::Completed.to_string(), "completed");
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_record_lifecycle() {
        let mut record = TaskRecord::pending("job-1");
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.started_at.is_none());

        assert!(record.mark_running());
        assert!(record.started_at.is_some());
        assert!(!record.mark_running());

        assert!(record.finish(
            TaskOutcome::Completed(json!({"ok": true})),
            Duration::from_millis(20)
        ));
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!({"ok": true})));
        assert!(record.error.is_none());
        assert_eq!(record.duration, Some(Duration::from_millis(20)));
        assert!(record.ended_at.is_some());

        // Terminal records are immutable
        assert!(!record.finish(TaskOutcome::Failed("late".into()), Duration::ZERO));
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[test]
    fn test_finish_requires_running() {
        let mut record = TaskRecord::pending("job-2");
        assert!(!record.finish(TaskOutcome::Failed("boom".into()), Duration::ZERO));
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[test]
    fn test_failed_outcome() {
        let mut record = TaskRecord::pending("job-3");
        record.mark_running();
        record.finish(
            TaskOutcome::from_result::<&str>(Err("connection refused")),
            Duration::from_millis(5),
        );

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("connection refused"));
        assert!(record.result.is_none());
        assert_eq!(
            record.outcome(),
            Some(TaskOutcome::Failed("connection refused".into()))
        );
    }

    #[test]
    fn test_serialization() {
        let mut record = TaskRecord::pending("job-4");
        record.mark_running();
        record.finish(TaskOutcome::Completed(json!(42)), Duration::from_millis(1500));

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["duration_ms"], 1500);
        assert!(value.get("error").is_none());

        let parsed: TaskRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_stats() {
        let mut stats = TaskStats::default();
        stats.record(TaskStatus::Running);
        stats.record(TaskStatus::Completed);
        stats.record(TaskStatus::Completed);
        stats.record(TaskStatus::Failed);

        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.total(), 4);
    }
}
