//! Envelopes for items leaving a worker pool

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A transformed item with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processed<O> {
    /// Transform output
    pub item: O,

    /// Id of the worker that produced it (`<pool>-worker-<n>`)
    pub processed_by: String,

    /// When the transform finished
    pub processed_at: DateTime<Utc>,

    /// Attempts it took, including the successful one
    pub attempts: u32,
}

impl<O> Processed<O> {
    pub(crate) fn new(item: O, worker_id: &str, attempts: u32) -> Self {
        Self {
            item,
            processed_by: worker_id.to_string(),
            processed_at: Utc::now(),
            attempts,
        }
    }

    /// Discard provenance and keep the output
    pub fn into_inner(self) -> O {
        self.item
    }
}

/// An input item set aside after exhausting its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter<I> {
    /// The input as it was submitted
    pub item: I,

    /// One error message per failed attempt, oldest first
    pub errors: Vec<String>,

    /// Worker that gave up on the item
    pub worker_id: String,

    pub failed_at: DateTime<Utc>,
}

impl<I> DeadLetter<I> {
    pub(crate) fn new(item: I, errors: Vec<String>, worker_id: &str) -> Self {
        Self {
            item,
            errors,
            worker_id: worker_id.to_string(),
            failed_at: Utc::now(),
        }
    }

    /// Number of attempts made
    pub fn attempts(&self) -> usize {
        self.errors.len()
    }

    /// Error from the final attempt
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_provenance() {
        let processed = Processed::new(42, "etl-worker-3", 2);
        assert_eq!(processed.processed_by, "etl-worker-3");
        assert_eq!(processed.attempts, 2);
        assert_eq!(processed.into_inner(), 42);
    }

    #[test]
    fn test_dead_letter() {
        let letter = DeadLetter::new(
            "payload",
            vec!["timeout".to_string(), "connection reset".to_string()],
            "etl-worker-0",
        );
        assert_eq!(letter.attempts(), 2);
        assert_eq!(letter.last_error(), Some("connection reset"));
        assert_eq!(letter.item, "payload");
    }

    #[test]
    fn test_processed_serialization() {
        let processed = Processed::new(serde_json::json!({"id": 1}), "w-0", 1);
        let value = serde_json::to_value(&processed).unwrap();
        assert_eq!(value["processed_by"], "w-0");
        assert_eq!(value["item"]["id"], 1);
    }
}
