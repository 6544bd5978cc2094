//! Reliability patterns for outbound work
//!
//! This module provides:
//! - [`RateLimiter`] - Token-bucket admission control
//! - [`RetryPolicy`] - Configurable retry with exponential backoff

mod rate_limiter;
mod retry;

pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterError};
pub use retry::RetryPolicy;
