//! Bounded-concurrency task manager
//!
//! Runs named units of work under a semaphore, recording each outcome in a
//! results table, with graceful shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::record::{TaskOutcome, TaskRecord, TaskStats, TaskStatus};
use crate::panic::panic_message;
use crate::serde_helpers::duration_millis;

/// Task manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskManagerConfig {
    /// Maximum units of work running at once
    pub max_concurrency: usize,

    /// Upper bound used by [`TaskManager::shutdown_with_timeout`]
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl TaskManagerConfig {
    /// Create a new task manager configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TaskManagerError> {
        if self.max_concurrency == 0 {
            return Err(TaskManagerError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Task manager errors
///
/// These are misuse errors only. Failures inside a unit of work are recorded
/// on its [`TaskRecord`] and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum TaskManagerError {
    /// A task with this id is pending or running
    #[error("task is already pending or running: {0}")]
    DuplicateTask(String),

    /// Shutdown has been initiated
    #[error("task manager is shutting down")]
    Shutdown,

    /// In-flight work did not drain in time
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// The runtime dropped the task before it recorded an outcome
    #[error("task {id} was aborted before recording an outcome: {reason}")]
    Aborted { id: String, reason: String },

    /// Invalid configuration
    #[error("invalid task manager configuration: {0}")]
    InvalidConfig(String),
}

/// Results table plus the shutdown flag, guarded together so that admission
/// and shutdown never interleave
#[derive(Default)]
struct ManagerState {
    records: HashMap<String, TaskRecord>,
    shutting_down: bool,
}

/// Bounded-concurrency executor for named units of work
///
/// # Example
///
/// ```ignore
/// use taskline::{TaskManager, TaskManagerConfig};
///
/// let manager = TaskManager::new(TaskManagerConfig::new().with_max_concurrency(3))?;
///
/// let record = manager
///     .submit("sync-orders", || async { sync_orders().await.map(|n| json!({"synced": n})) })
///     .await?;
///
/// // Failures are data, not errors
/// if let Some(error) = &record.error {
///     warn!(%error, "sync failed");
/// }
///
/// manager.shutdown().await;
/// ```
pub struct TaskManager {
    config: TaskManagerConfig,
    state: Arc<Mutex<ManagerState>>,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl TaskManager {
    /// Create a new task manager
    pub fn new(config: TaskManagerConfig) -> Result<Self, TaskManagerError> {
        config.validate()?;

        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            state: Arc::new(Mutex::new(ManagerState::default())),
            tracker: TaskTracker::new(),
        })
    }

    /// Submit a unit of work and wait for its terminal record
    ///
    /// Suspends while all admission slots are taken. The unit runs on its own
    /// tracked task, so dropping this future does not cancel it: the record
    /// still reaches a terminal state and [`shutdown`](Self::shutdown) still
    /// waits for it.
    ///
    /// Only ids that are pending or running are duplicates. Submitting the id
    /// of a completed or failed task replaces that terminal record with a new
    /// pending one.
    pub async fn submit<F, Fut, E>(
        &self,
        id: impl Into<String>,
        unit: F,
    ) -> Result<TaskRecord, TaskManagerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (record, handle) = self.launch(id.into(), unit)?;

        handle.await.map_err(|e| TaskManagerError::Aborted {
            id: record.id,
            reason: e.to_string(),
        })
    }

    /// Submit a unit of work without waiting for it
    ///
    /// Returns the pending record. Misuse errors are still reported
    /// synchronously; the outcome is available through
    /// [`get_result`](Self::get_result) once terminal.
    pub fn spawn<F, Fut, E>(
        &self,
        id: impl Into<String>,
        unit: F,
    ) -> Result<TaskRecord, TaskManagerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (record, _handle) = self.launch(id.into(), unit)?;
        Ok(record)
    }

    /// Look up a record without blocking
    pub fn get_result(&self, id: &str) -> Option<TaskRecord> {
        self.state.lock().records.get(id).cloned()
    }

    /// Snapshot of every record
    pub fn records(&self) -> Vec<TaskRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Number of records currently running
    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| r.status == TaskStatus::Running)
            .count()
    }

    /// Per-status counts
    pub fn stats(&self) -> TaskStats {
        let state = self.state.lock();
        let mut stats = TaskStats::default();
        for record in state.records.values() {
            stats.record(record.status);
        }
        stats
    }

    /// Whether shutdown has been initiated
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Get the configuration
    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// Stop admitting work and wait for every in-flight unit to finish
    ///
    /// Idempotent: later calls only wait for whatever is still draining.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.shutting_down, true)
        };

        if first {
            info!(in_flight = self.tracker.len(), "Initiating graceful shutdown");
        }

        self.tracker.close();
        self.tracker.wait().await;

        if first {
            info!("Task manager stopped");
        }
    }

    /// [`shutdown`](Self::shutdown) bounded by the configured timeout
    ///
    /// On timeout the manager stays shut down; in-flight units keep running.
    pub async fn shutdown_with_timeout(&self) -> Result<(), TaskManagerError> {
        match tokio::time::timeout(self.config.shutdown_timeout, self.shutdown()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    remaining_tasks = self.tracker.len(),
                    "Shutdown timeout reached"
                );
                Err(TaskManagerError::ShutdownTimeout)
            }
        }
    }

    /// Register a pending record and spawn its lifecycle
    fn launch<F, Fut, E>(
        &self,
        id: String,
        unit: F,
    ) -> Result<(TaskRecord, JoinHandle<TaskRecord>), TaskManagerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let mut state = self.state.lock();

        if state.shutting_down {
            return Err(TaskManagerError::Shutdown);
        }

        if let Some(existing) = state.records.get(&id) {
            if !existing.is_terminal() {
                return Err(TaskManagerError::DuplicateTask(id));
            }
            debug!(task_id = %id, "Replacing terminal record");
        }

        let record = TaskRecord::pending(id.clone());
        state.records.insert(id.clone(), record.clone());

        // Spawned under the lock so shutdown cannot close the tracker between
        // admission and tracking.
        let handle = self.tracker.spawn(run_task(
            Arc::clone(&self.state),
            Arc::clone(&self.slots),
            id,
            unit,
        ));

        Ok((record, handle))
    }
}

/// Apply `f` to the record for `id` and return a snapshot of it
fn update_record(
    state: &Mutex<ManagerState>,
    id: &str,
    f: impl FnOnce(&mut TaskRecord) -> bool,
) -> Option<TaskRecord> {
    let mut state = state.lock();
    let record = state.records.get_mut(id)?;
    if !f(record) {
        warn!(task_id = %id, status = %record.status, "Rejected out-of-order status transition");
    }
    Some(record.clone())
}

/// Full lifecycle of one unit of work: admit, run, record, release
async fn run_task<F, Fut, E>(
    state: Arc<Mutex<ManagerState>>,
    slots: Arc<Semaphore>,
    id: String,
    unit: F,
) -> TaskRecord
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<serde_json::Value, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let permit = slots.acquire_owned().await;

    let started = Instant::now();
    update_record(&state, &id, TaskRecord::mark_running);
    debug!(task_id = %id, "Task started");

    let outcome = match permit {
        Ok(_) => match AssertUnwindSafe(async move { unit().await })
            .catch_unwind()
            .await
        {
            Ok(result) => TaskOutcome::from_result(result),
            Err(payload) => {
                TaskOutcome::Failed(format!("task panicked: {}", panic_message(payload.as_ref())))
            }
        },
        Err(_) => TaskOutcome::Failed("admission slots closed".to_string()),
    };

    let elapsed = started.elapsed();
    match &outcome {
        TaskOutcome::Completed(_) => {
            info!(task_id = %id, duration_ms = elapsed.as_millis() as u64, "Task completed")
        }
        TaskOutcome::Failed(error) => {
            warn!(task_id = %id, duration_ms = elapsed.as_millis() as u64, %error, "Task failed")
        }
    }

    // The permit is held until the terminal state is visible.
    let record = update_record(&state, &id, |r| r.finish(outcome, elapsed))
        .unwrap_or_else(|| TaskRecord::pending(id.as_str()));
    drop(permit);

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    fn manager(max: usize) -> TaskManager {
        TaskManager::new(TaskManagerConfig::new().with_max_concurrency(max)).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TaskManagerConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = TaskManagerConfig::new()
            .with_max_concurrency(0)
            .with_shutdown_timeout(Duration::from_secs(5));

        // Clamped to at least one slot
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let config: TaskManagerConfig =
            serde_json::from_str(r#"{"max_concurrency": 0, "shutdown_timeout": 1000}"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(TaskManagerError::InvalidConfig(_))
        ));
        assert!(TaskManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_submit_success() {
        let manager = manager(2);

        let record = manager
            .submit("ok", || async { Ok::<_, String>(json!({"value": 1})) })
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!({"value": 1})));
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_some());
        assert!(record.duration.is_some());
        assert_eq!(manager.get_result("ok"), Some(record));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_raised() {
        let manager = manager(2);

        let record = manager
            .submit("bad", || async { Err::<serde_json::Value, _>("disk full") })
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("disk full"));
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn test_panic_is_recorded() {
        let manager = manager(1);

        let record = manager
            .submit("panics", || async {
                if true {
                    panic!("unit exploded");
                }
                Ok::<_, String>(json!(null))
            })
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("unit exploded"));

        // The slot was released
        let next = manager
            .submit("after", || async { Ok::<_, String>(json!(1)) })
            .await
            .unwrap();
        assert_eq!(next.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_live_id_rejected() {
        let manager = manager(2);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let pending = manager
            .spawn("dup", move || async move {
                let _ = release_rx.await;
                Ok::<_, String>(json!("first"))
            })
            .unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);

        let second = manager
            .submit("dup", || async { Ok::<_, String>(json!("second")) })
            .await;
        assert!(matches!(second, Err(TaskManagerError::DuplicateTask(id)) if id == "dup"));

        release_tx.send(()).unwrap();
        manager.shutdown().await;

        let record = manager.get_result("dup").unwrap();
        assert_eq!(record.result, Some(json!("first")));
    }

    #[tokio::test]
    async fn test_terminal_id_can_be_resubmitted() {
        let manager = manager(1);

        manager
            .submit("again", || async { Err::<serde_json::Value, _>("first try") })
            .await
            .unwrap();
        let record = manager
            .submit("again", || async { Ok::<_, String>(json!("second try")) })
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(manager.records().len(), 1);

        // The failed record is gone, not merged
        let stored = manager.get_result("again").unwrap();
        assert_eq!(stored.result, Some(json!("second try")));
        assert_eq!(stored.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let manager = manager(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let submissions = [1000_u64, 2000, 500, 1500].into_iter().enumerate().map(|(i, ms)| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            manager.submit(format!("task-{i}"), move || async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(json!(ms))
            })
        });

        let started = tokio::time::Instant::now();
        let sampler = async {
            let mut max_running = 0;
            while started.elapsed() < Duration::from_millis(2500) {
                max_running = max_running.max(manager.running_count());
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            max_running
        };

        let (records, max_running) =
            tokio::join!(futures::future::join_all(submissions), sampler);

        assert!(max_running <= 3, "sampled {max_running} running tasks");
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        for record in records {
            assert_eq!(record.unwrap().status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let manager = manager(2);

        for i in 0..5 {
            manager
                .spawn(format!("job-{i}"), move || async move {
                    tokio::time::sleep(Duration::from_millis(10 * i)).await;
                    Ok::<_, String>(json!(i))
                })
                .unwrap();
        }

        manager.shutdown().await;

        assert!(manager.is_shutdown());
        assert!(manager.records().iter().all(TaskRecord::is_terminal));
        assert_eq!(manager.stats().completed, 5);

        let late = manager
            .submit("late", || async { Ok::<_, String>(json!(null)) })
            .await;
        assert!(matches!(late, Err(TaskManagerError::Shutdown)));

        // Second call is a no-op
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_submit_still_finishes() {
        let manager = manager(1);

        let submit = manager.submit("detached", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, String>(json!("done"))
        });
        // Poll once so the task is registered, then drop the future
        let _ = tokio::time::timeout(Duration::from_millis(1), submit).await;

        manager.shutdown().await;
        let record = manager.get_result("detached").unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout() {
        let manager = TaskManager::new(
            TaskManagerConfig::new()
                .with_max_concurrency(1)
                .with_shutdown_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        manager
            .spawn("slow", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(json!(null))
            })
            .unwrap();

        let result = manager.shutdown_with_timeout().await;
        assert!(matches!(result, Err(TaskManagerError::ShutdownTimeout)));
        assert!(manager.is_shutdown());
    }
}
