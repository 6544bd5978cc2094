//! TTL caching
//!
//! [`TtlCache`] keeps values for a fixed time-to-live. Expired entries are
//! logically absent immediately and physically removed lazily, or by the
//! optional sweeper started with [`TtlCache::spawn_sweeper`].

mod ttl;

pub use ttl::{CacheConfig, CacheError, TtlCache};
