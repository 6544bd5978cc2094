//! Token-bucket rate limiter
//!
//! Capacity accumulates continuously from elapsed time rather than in
//! discrete ticks: bursts are bounded by `rate` and steady-state throughput
//! converges to `rate / per`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::serde_helpers::duration_millis;

/// Rate limiter configuration
///
/// # Example
///
/// ```
/// use taskline::RateLimiterConfig;
/// use std::time::Duration;
///
/// // Two permits per second
/// let config = RateLimiterConfig::new(2.0, Duration::from_secs(1));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimiterConfig {
    /// Permits per window; also the burst size
    pub rate: f64,

    /// Window length
    #[serde(with = "duration_millis")]
    pub per: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            per: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    /// Create a configuration allowing `rate` permits every `per`
    pub fn new(rate: f64, per: Duration) -> Self {
        Self { rate, per }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RateLimiterError> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(RateLimiterError::InvalidConfig(format!(
                "rate must be a positive number, got {}",
                self.rate
            )));
        }
        if self.per.is_zero() {
            return Err(RateLimiterError::InvalidConfig(
                "per must be greater than zero".into(),
            ));
        }
        if Duration::try_from_secs_f64(self.seconds_per_permit()).is_err() {
            return Err(RateLimiterError::InvalidConfig(format!(
                "refill interval per / rate is out of range ({} / {})",
                self.per.as_secs_f64(),
                self.rate
            )));
        }
        Ok(())
    }

    /// Seconds needed to refill one permit
    fn seconds_per_permit(&self) -> f64 {
        self.per.as_secs_f64() / self.rate
    }
}

/// Rate limiter errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimiterError {
    /// Invalid configuration
    #[error("invalid rate limiter configuration: {0}")]
    InvalidConfig(String),
}

/// Mutable bucket state; `0 <= allowance <= rate` whenever the lock is free
#[derive(Debug)]
struct Bucket {
    allowance: f64,
    last_check: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, config: &RateLimiterConfig) {
        let elapsed = now.saturating_duration_since(self.last_check).as_secs_f64();
        self.last_check = now;
        self.allowance = (self.allowance + elapsed / config.seconds_per_permit()).min(config.rate);
    }
}

/// Token-bucket rate limiter safe for concurrent callers
///
/// The bucket starts full. The refill, check and consume steps run in one
/// critical section that stays locked while a caller sleeps for a refill, so
/// concurrent callers queue behind each other and never split a fractional
/// permit.
///
/// # Example
///
/// ```ignore
/// use taskline::{RateLimiter, RateLimiterConfig};
///
/// let limiter = RateLimiter::new(RateLimiterConfig::new(5.0, Duration::from_secs(1)))?;
///
/// for url in urls {
///     limiter.acquire().await;
///     fetch(url).await?;
/// }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a new rate limiter with a full bucket
    pub fn new(config: RateLimiterConfig) -> Result<Self, RateLimiterError> {
        config.validate()?;

        Ok(Self {
            bucket: Mutex::new(Bucket {
                allowance: config.rate,
                last_check: Instant::now(),
            }),
            config,
        })
    }

    /// Wait until a permit is available and take it
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), &self.config);

        if bucket.allowance >= 1.0 {
            bucket.allowance -= 1.0;
            return;
        }

        let wait = Duration::try_from_secs_f64(
            (1.0 - bucket.allowance) * self.config.seconds_per_permit(),
        )
        .unwrap_or(Duration::MAX);
        trace!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting for refill");
        tokio::time::sleep(wait).await;

        // The sleep paid for exactly one permit; restart accrual from here so
        // the waited time is not counted again by the next caller.
        bucket.allowance = 0.0;
        bucket.last_check = Instant::now();
    }

    /// Take a permit if one is available right now
    ///
    /// Returns false instead of waiting, including when another caller is
    /// currently holding the bucket.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut bucket) = self.bucket.try_lock() else {
            return false;
        };
        bucket.refill(Instant::now(), &self.config);

        if bucket.allowance >= 1.0 {
            bucket.allowance -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current allowance after refill, or `None` while a caller is waiting
    pub fn available(&self) -> Option<f64> {
        let mut bucket = self.bucket.try_lock().ok()?;
        bucket.refill(Instant::now(), &self.config);
        Some(bucket.allowance)
    }

    /// Get the configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(rate: f64, per: Duration) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig::new(rate, per)).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.rate, 10.0);
        assert_eq!(config.per, Duration::from_secs(1));
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimiterConfig::new(0.0, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(RateLimiterConfig::new(-1.0, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(RateLimiterConfig::new(f64::NAN, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(RateLimiterConfig::new(1.0, Duration::ZERO)
            .validate()
            .is_err());
        assert!(RateLimiterConfig::new(0.5, Duration::from_millis(10))
            .validate()
            .is_ok());

        // One permit every 1e20 seconds does not fit in a Duration
        let config = RateLimiterConfig::new(1e-20, Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(RateLimiterError::InvalidConfig(_))
        ));
        assert!(RateLimiter::new(config).is_err());
    }

    #[test]
    fn test_serialization() {
        let config = RateLimiterConfig::new(2.0, Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"rate":2.0,"per":1500}"#);

        let parsed: RateLimiterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_immediate() {
        let limiter = limiter(3.0, Duration::from_secs(1));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_acquires_respect_rate() {
        let limiter = limiter(2.0, Duration::from_secs(1));
        let start = Instant::now();

        for _ in 0..5 {
            limiter.acquire().await;
        }

        // 2 free permits, then 3 refills of 500ms each
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_do_not_share_permits() {
        let limiter = Arc::new(limiter(1.0, Duration::from_millis(100)));
        let start = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }
        finished.sort();

        // One free permit, then one every 100ms
        assert!(start.elapsed() >= Duration::from_millis(400));
        for pair in finished.windows(2).skip(1) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_rate() {
        let limiter = limiter(2.0, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), Some(2.0));

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_refill() {
        let limiter = limiter(4.0, Duration::from_secs(1));
        for _ in 0..4 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(125)).await;
        let available = limiter.available().unwrap();
        assert!((available - 0.5).abs() < 1e-9);
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(125)).await;
        assert!(limiter.try_acquire());
    }
}
