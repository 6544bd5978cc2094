//! # Taskline
//!
//! Async coordination primitives for building in-process pipelines.
//!
//! ## Features
//!
//! - **Bounded task execution**: [`TaskManager`] runs named units of work under a
//!   concurrency ceiling and keeps a [`TaskRecord`] for every submission
//! - **Worker pools**: [`WorkerPool`] drains a bounded input channel with N workers,
//!   isolating per-item failures through retries and a dead-letter sink
//! - **Rate limiting**: [`RateLimiter`] is a token bucket with continuous refill
//! - **TTL caching**: [`TtlCache`] expires entries lazily, with an optional sweeper
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TaskManager                            │
//! │  (semaphore-bounded, records pending → running → terminal)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ one unit of work per stage
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  input (bounded) ──► [worker 0..N] ──► output / dead letters │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ inside the transform
//!                              ▼
//! ┌────────────────────────┐        ┌────────────────────────────┐
//! │      RateLimiter       │        │          TtlCache          │
//! │  (token bucket)        │        │  (lazy expiry)             │
//! └────────────────────────┘        └────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use taskline::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), TaskManagerError> {
//! let manager = TaskManager::new(TaskManagerConfig::default().with_max_concurrency(3))?;
//!
//! let record = manager
//!     .submit("fetch-users", || async { Ok::<_, String>(json!({"users": 3})) })
//!     .await?;
//! assert_eq!(record.status, TaskStatus::Completed);
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod reliability;
pub mod task;
pub mod worker;

mod panic;
mod serde_helpers;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cache::{CacheConfig, CacheError, TtlCache};
    pub use crate::reliability::{RateLimiter, RateLimiterConfig, RateLimiterError, RetryPolicy};
    pub use crate::task::{
        TaskManager, TaskManagerConfig, TaskManagerError, TaskOutcome, TaskRecord, TaskStats,
        TaskStatus,
    };
    pub use crate::worker::{
        DeadLetter, FailurePolicy, PoolSender, PoolStats, Processed, WorkerPool, WorkerPoolConfig,
        WorkerPoolError, WorkerPoolStatus,
    };
}

// Re-export key types at crate root
pub use cache::{CacheConfig, CacheError, TtlCache};
pub use reliability::{RateLimiter, RateLimiterConfig, RateLimiterError, RetryPolicy};
pub use task::{
    TaskManager, TaskManagerConfig, TaskManagerError, TaskOutcome, TaskRecord, TaskStats,
    TaskStatus,
};
pub use worker::{
    DeadLetter, FailurePolicy, PoolSender, PoolStats, Processed, WorkerPool, WorkerPoolConfig,
    WorkerPoolError, WorkerPoolStatus,
};
