//! Worker pool for item processing
//!
//! Drains a bounded input channel with N workers, applying a transform to each
//! item and pushing results to an output channel, with graceful shutdown.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::item::{DeadLetter, Processed};
use crate::panic::panic_message;
use crate::reliability::RetryPolicy;
use crate::serde_helpers::duration_millis;

/// What a worker does with an item once its attempts are exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the cause and discard the item
    #[default]
    Drop,

    /// Route the item to the dead-letter channel
    DeadLetter,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Pool name, used as the worker id prefix
    pub name: String,

    /// Input channel capacity; producers suspend when it is full
    pub input_capacity: usize,

    /// How long a worker waits for an item before re-checking shutdown
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Handling of items that fail every attempt
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Per-item retries
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: format!("pool-{}", Uuid::now_v7()),
            input_capacity: 100,
            poll_interval: Duration::from_millis(100),
            failure_policy: FailurePolicy::Drop,
            retry: RetryPolicy::none(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the input channel capacity
    pub fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity.max(1);
        self
    }

    /// Set the dequeue wait
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the failure policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), WorkerPoolError> {
        if self.name.trim().is_empty() {
            return Err(WorkerPoolError::InvalidConfig("name must not be empty".into()));
        }
        if self.input_capacity == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "input_capacity must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(WorkerPoolError::InvalidConfig(
                "poll_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// No workers; input is rejected
    Stopped,
    /// Workers are draining the input channel
    Running,
    /// Stop requested; workers finish their current item and exit
    Draining,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Pool already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Pool not running
    #[error("worker pool is not running")]
    NotRunning,

    /// Invalid configuration
    #[error("invalid worker pool configuration: {0}")]
    InvalidConfig(String),
}

/// Counters since the pool was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Items accepted into the input channel
    pub received: u64,
    /// Items transformed successfully
    pub processed: u64,
    /// Items that failed every attempt
    pub failed: u64,
    /// Extra attempts made after a failure
    pub retried: u64,
    /// Failed items sent to the dead-letter channel
    pub dead_lettered: u64,
    /// Failed items discarded
    pub dropped: u64,
}

#[derive(Default)]
struct PoolCounters {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the pool, its workers and its input handles
struct PoolShared {
    status: RwLock<WorkerPoolStatus>,
    counters: PoolCounters,
    /// Accepted items not yet acknowledged by a worker
    outstanding: AtomicUsize,
    idle: Notify,
}

impl PoolShared {
    fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    fn acknowledge(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Type-erased per-item transform
type Transform<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, String>> + Send + Sync>;

/// Cloneable producer handle for a pool's input channel
pub struct PoolSender<I> {
    tx: mpsc::Sender<I>,
    shared: Arc<PoolShared>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<I> Clone for PoolSender<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }
}

impl<I> PoolSender<I> {
    /// Enqueue an item, suspending while the input channel is full
    ///
    /// Fails with [`WorkerPoolError::NotRunning`] if the pool is not running
    /// or stops while this call is waiting for capacity. The item is not
    /// enqueued in that case.
    pub async fn send(&self, item: I) -> Result<(), WorkerPoolError> {
        if self.shared.status() != WorkerPoolStatus::Running {
            return Err(WorkerPoolError::NotRunning);
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let permit = tokio::select! {
            biased;

            _ = shutdown_rx.wait_for(|stopping| *stopping) => {
                return Err(WorkerPoolError::NotRunning);
            }
            permit = self.tx.reserve() => permit.map_err(|_| WorkerPoolError::NotRunning)?,
        };

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        self.shared.counters.received.fetch_add(1, Ordering::Relaxed);
        permit.send(item);
        Ok(())
    }

    /// Free slots in the input channel
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Worker pool that applies a transform to every item it receives
///
/// # Example
///
/// ```ignore
/// use taskline::{WorkerPool, WorkerPoolConfig, FailurePolicy};
///
/// let pool = WorkerPool::new(
///     WorkerPoolConfig::new("thumbnails").with_failure_policy(FailurePolicy::DeadLetter),
///     |image: Image| async move { resize(image).await },
/// )?;
///
/// let mut output = pool.take_output().unwrap();
/// pool.start(4)?;
///
/// let input = pool.input();
/// for image in images {
///     input.send(image).await?;
/// }
///
/// pool.join().await;
/// pool.stop().await;
/// ```
pub struct WorkerPool<I, O> {
    config: WorkerPoolConfig,
    transform: Transform<I, O>,
    shared: Arc<PoolShared>,
    input_tx: mpsc::Sender<I>,
    input_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<I>>>,
    output_tx: mpsc::UnboundedSender<Processed<O>>,
    output_rx: Mutex<Option<mpsc::UnboundedReceiver<Processed<O>>>>,
    dead_letter_tx: mpsc::UnboundedSender<DeadLetter<I>>,
    dead_letter_rx: Mutex<Option<mpsc::UnboundedReceiver<DeadLetter<I>>>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Held for the whole of `stop()` so overlapping calls share one drain
    stopping: tokio::sync::Mutex<()>,
}

impl<I, O> WorkerPool<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    /// Create a stopped pool
    pub fn new<F, Fut, E>(config: WorkerPoolConfig, transform: F) -> Result<Self, WorkerPoolError>
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        config.validate()?;

        let transform: Transform<I, O> = Arc::new(move |item| {
            let fut = transform(item);
            async move { fut.await.map_err(|e| e.to_string()) }.boxed()
        });

        let (input_tx, input_rx) = mpsc::channel(config.input_capacity);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (dead_letter_tx, dead_letter_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            transform,
            shared: Arc::new(PoolShared {
                status: RwLock::new(WorkerPoolStatus::Stopped),
                counters: PoolCounters::default(),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            input_tx,
            input_rx: Arc::new(tokio::sync::Mutex::new(input_rx)),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            dead_letter_tx,
            dead_letter_rx: Mutex::new(Some(dead_letter_rx)),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            stopping: tokio::sync::Mutex::new(()),
        })
    }

    /// Spawn `worker_count` workers
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub fn start(&self, worker_count: usize) -> Result<(), WorkerPoolError> {
        if worker_count == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }

        {
            let mut status = self.shared.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        self.shutdown_tx.send_replace(false);

        let mut workers = self.workers.lock();
        for n in 0..worker_count {
            let worker = Worker {
                id: format!("{}-worker-{}", self.config.name, n),
                transform: Arc::clone(&self.transform),
                shared: Arc::clone(&self.shared),
                input_rx: Arc::clone(&self.input_rx),
                output_tx: self.output_tx.clone(),
                dead_letter_tx: self.dead_letter_tx.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                failure_policy: self.config.failure_policy,
                retry: self.config.retry.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        info!(
            pool = %self.config.name,
            worker_count,
            input_capacity = self.config.input_capacity,
            "Worker pool started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for every worker to exit
    ///
    /// Items already dequeued finish; items still in the input channel stay
    /// there for a later [`start`](Self::start). A call that overlaps another
    /// `stop()` waits for the same drain to finish. [`start`](Self::start)
    /// fails with [`WorkerPoolError::AlreadyRunning`] until it has.
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn stop(&self) {
        let _stopping = self.stopping.lock().await;

        {
            let mut status = self.shared.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return;
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(pool = %self.config.name, "Stopping worker pool");
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(pool = %self.config.name, "Worker exited abnormally: {}", e);
            }
        }

        *self.shared.status.write() = WorkerPoolStatus::Stopped;
        info!(pool = %self.config.name, stats = ?self.stats(), "Worker pool stopped");
    }

    /// Wait until every accepted item has been acknowledged
    ///
    /// Items left queued by [`stop`](Self::stop) count as outstanding until
    /// the pool is started again.
    pub async fn join(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Producer handle for the input channel
    pub fn input(&self) -> PoolSender<I> {
        PoolSender {
            tx: self.input_tx.clone(),
            shared: Arc::clone(&self.shared),
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Take the output receiver; `None` after the first call
    pub fn take_output(&self) -> Option<mpsc::UnboundedReceiver<Processed<O>>> {
        self.output_rx.lock().take()
    }

    /// Take the dead-letter receiver; `None` after the first call
    pub fn take_dead_letters(&self) -> Option<mpsc::UnboundedReceiver<DeadLetter<I>>> {
        self.dead_letter_rx.lock().take()
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        self.shared.status()
    }

    /// Get counters
    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot()
    }

    /// Number of live worker tasks
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Accepted items not yet acknowledged
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Get the configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

/// Everything one worker loop owns
struct Worker<I, O> {
    id: String,
    transform: Transform<I, O>,
    shared: Arc<PoolShared>,
    input_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<I>>>,
    output_tx: mpsc::UnboundedSender<Processed<O>>,
    dead_letter_tx: mpsc::UnboundedSender<DeadLetter<I>>,
    shutdown_rx: watch::Receiver<bool>,
    poll_interval: Duration,
    failure_policy: FailurePolicy,
    retry: RetryPolicy,
}

impl<I, O> Worker<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let input_rx = Arc::clone(&self.input_rx);
            let next = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        debug!(worker_id = %self.id, "Pool dropped");
                        break;
                    }
                    continue;
                }
                next = tokio::time::timeout(
                    self.poll_interval,
                    async move { input_rx.lock().await.recv().await },
                ) => next,
            };

            match next {
                Ok(Some(item)) => {
                    self.process(item).await;
                    self.shared.acknowledge();
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "Input channel closed");
                    break;
                }
                // Bounded wait elapsed; loop to re-check shutdown
                Err(_) => {}
            }
        }

        debug!(worker_id = %self.id, "Worker exited");
    }

    /// Run the transform with retries; never panics or returns an error
    async fn process(&self, item: I) {
        let mut errors = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let run = {
                let input = item.clone();
                let transform = Arc::clone(&self.transform);
                AssertUnwindSafe(async move { transform(input).await }).catch_unwind()
            };

            let error = match run.await {
                Ok(Ok(output)) => {
                    self.shared.counters.processed.fetch_add(1, Ordering::Relaxed);
                    if self
                        .output_tx
                        .send(Processed::new(output, &self.id, attempt))
                        .is_err()
                    {
                        debug!(worker_id = %self.id, "Output receiver dropped, discarding result");
                    }
                    return;
                }
                Ok(Err(e)) => e,
                Err(payload) => format!("transform panicked: {}", panic_message(payload.as_ref())),
            };

            errors.push(error);

            if self.retry.has_attempts_remaining(attempt) {
                self.shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                let delay = self.retry.delay_for_attempt(attempt + 1);
                debug!(
                    worker_id = %self.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transform failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            break;
        }

        self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        let cause = errors.last().cloned().unwrap_or_default();

        match self.failure_policy {
            FailurePolicy::Drop => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id = %self.id, attempts = attempt, error = %cause, "Dropping failed item");
            }
            FailurePolicy::DeadLetter => {
                self.shared.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id = %self.id, attempts = attempt, error = %cause, "Dead-lettering failed item");
                if self
                    .dead_letter_tx
                    .send(DeadLetter::new(item, errors, &self.id))
                    .is_err()
                {
                    debug!(worker_id = %self.id, "Dead-letter receiver dropped, discarding item");
                }
            }
        }
    }
}
