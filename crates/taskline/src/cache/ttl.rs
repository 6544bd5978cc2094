//! Expiring key/value store

use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::serde_helpers::{duration_millis, option_duration_millis};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum age of a visible entry
    #[serde(with = "duration_millis")]
    pub ttl: Duration,

    /// Background purge interval (None = lazy eviction only)
    #[serde(default, with = "option_duration_millis")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given TTL and lazy eviction
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sweep_interval: None,
        }
    }

    /// Enable a background sweeper
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig("ttl must be greater than zero".into()));
        }
        if self.sweep_interval.is_some_and(|i| i.is_zero()) {
            return Err(CacheError::InvalidConfig(
                "sweep_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Cache errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Invalid configuration
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

/// Key/value store whose entries disappear `ttl` after they were set
///
/// Eviction is lazy: an expired entry is removed by the next `get` that sees
/// it, by [`purge_expired`](Self::purge_expired), or by the optional sweeper.
/// Every operation runs under one mutex.
///
/// # Example
///
/// ```
/// use taskline::{CacheConfig, TtlCache};
/// use std::time::Duration;
///
/// let cache = TtlCache::new(CacheConfig::new(Duration::from_secs(60))).unwrap();
/// cache.set("user:1", "alice".to_string());
/// assert_eq!(cache.get("user:1"), Some("alice".to_string()));
/// ```
pub struct TtlCache<K, V> {
    config: CacheConfig,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        Ok(Self {
            config,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Get a live value, evicting it if expired
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;

        if entry.is_live(Instant::now(), self.config.ttl) {
            return Some(entry.value.clone());
        }

        entries.remove(key);
        None
    }

    /// Store a value, replacing any previous entry and restarting its TTL
    pub fn set(&self, key: K, value: V) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Remove an entry; returns whether anything was physically removed
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Whether a live entry exists for the key
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Physically stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is physically stored
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every expired entry and return how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now, ttl));
        before - entries.len()
    }

    /// Return the cached value or load, cache and return a fresh one
    ///
    /// The lock is not held while `load` runs, so concurrent misses on the
    /// same key may both load; the last one to finish wins. Errors are not
    /// cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let value = load().await?;
        self.set(key, value.clone());
        Ok(value)
    }

    /// Get the configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Start the background sweeper if `sweep_interval` is configured
    ///
    /// The loop exits when `shutdown` flips to true or its sender is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let interval = self.config.sweep_interval?;
        let cache = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired cache entries");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("Cache sweeper: shutdown requested");
                        break;
                    }
                }
            }
        }))
    }
}
