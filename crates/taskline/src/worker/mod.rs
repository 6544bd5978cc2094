//! Channel-fed worker pools
//!
//! A [`WorkerPool`] owns a bounded input channel, an output channel of
//! [`Processed`] results and a dead-letter channel of [`DeadLetter`] items.
//! Each worker loops: wait up to `poll_interval` for an item, run the
//! transform (with retries), emit the result, check for shutdown.
//!
//! ```text
//!  PoolSender ──► [ input (bounded) ] ──► worker-0 ─┐
//!                                    ├──► worker-1 ─┼──► [ output ]
//!                                    └──► worker-N ─┴──► [ dead letters ]
//! ```

mod item;
mod pool;

pub use item::{DeadLetter, Processed};
pub use pool::{
    FailurePolicy, PoolSender, PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    WorkerPoolStatus,
};
