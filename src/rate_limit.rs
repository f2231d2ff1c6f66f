//! Fixed-window rate limiting.
//!
//! - [`RateLimitConfig`]: quota (`limit` requests per `window`).
//! - [`WindowState`]: the per-key counter record.
//! - [`RateLimitDecision`]: uniform result of a check, also used for failure paths.
//! - [`WindowCounter`]: the seam between the façade and a counting backend.
//!
//! # Architecture
//!
//! - **Actor** ([`actor`]): one task per key serializes every check. Strictly correct.
//! - **Shared cache** ([`shared_cache`]): read-then-write against a [`KvStore`](crate::store::KvStore).
//!   Racy by nature; only used when no actor tier is provisioned.
//! - **Façade** ([`facade`]): picks the backend from configuration and normalizes every
//!   failure into a decision.
//! - **Middleware** ([`middleware`]): tower layer applying the façade to any service.
//!
//! Time is cut into globally aligned buckets: `window_start = now - (now % window_ms)`.
//! A check whose bucket differs from the stored one restarts the count at 1.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, LimiterError};

pub mod actor;
pub mod facade;
pub mod middleware;
pub mod shared_cache;

pub use actor::ActorCounter;
pub use facade::{check_rate_limit, CacheFailureMode, CounterBackend, RateLimiter};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use shared_cache::SharedCacheCounter;

/// Validated quota: at most `limit` admissions per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    limit: u32,
    window_ms: u64,
}

impl RateLimitConfig {
    /// Errors if `limit` is zero or `window` is shorter than a millisecond.
    pub fn new(limit: u32, window: Duration) -> Result<Self, ConfigError> {
        Self::from_millis(limit, u64::try_from(window.as_millis()).unwrap_or(u64::MAX))
            .map_err(|err| match err {
                ConfigError::InvalidWindow(_) => ConfigError::InvalidWindow(window),
                other => other,
            })
    }

    /// Same as [`new`](Self::new) with the window in milliseconds.
    pub fn from_millis(limit: u32, window_ms: u64) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit(limit));
        }
        if window_ms == 0 {
            return Err(ConfigError::InvalidWindow(Duration::from_millis(window_ms)));
        }
        Ok(Self { limit, window_ms })
    }

    /// For constants known to be positive.
    pub(crate) const fn from_parts(limit: u32, window_ms: u64) -> Self {
        assert!(limit > 0 && window_ms > 0);
        Self { limit, window_ms }
    }

    /// Convenience for `limit` per minute.
    pub fn per_minute(limit: u32) -> Result<Self, ConfigError> {
        Self::from_millis(limit, 60_000)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Start of the bucket containing `now`.
    pub fn window_start(&self, now: u64) -> u64 {
        now - (now % self.window_ms)
    }

    /// Milliseconds from `now` until the next bucket opens.
    pub fn retry_after_ms(&self, now: u64) -> u64 {
        self.window_start(now).saturating_add(self.window_ms).saturating_sub(now)
    }
}

/// Stored counter for one key. At most one is live per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowState {
    pub window_start: u64,
    pub count: u32,
}

impl WindowState {
    /// Apply one admission check at `now`, returning the new state and the decision.
    ///
    /// A missing state or one from an earlier bucket restarts at `count = 1` and is always
    /// allowed; otherwise the count is incremented (even past the limit) and compared.
    pub fn advance(
        previous: Option<WindowState>,
        config: &RateLimitConfig,
        now: u64,
    ) -> (WindowState, RateLimitDecision) {
        let window_start = config.window_start(now);
        let next = match previous {
            Some(state) if state.window_start == window_start => {
                WindowState { window_start, count: state.count.saturating_add(1) }
            }
            _ => WindowState { window_start, count: 1 },
        };
        let decision = RateLimitDecision::from_count(config, next.count, now);
        (next, decision)
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    /// `max(0, limit - count)`.
    pub remaining: u32,
    pub window_ms: u64,
    pub window_start: u64,
    /// Time until the next window; only meaningful when `allowed` is false.
    pub retry_after_ms: u64,
    /// True only for a fail-closed denial after the limiter itself failed. Fail-open allows
    /// leave it false. Callers answer 503 instead of 429 for these denials.
    #[serde(default)]
    pub unavailable: bool,
}

impl RateLimitDecision {
    /// Decision for a counter that has reached `count` in the bucket containing `now`.
    pub fn from_count(config: &RateLimitConfig, count: u32, now: u64) -> Self {
        Self {
            allowed: count <= config.limit,
            limit: config.limit,
            remaining: config.limit.saturating_sub(count),
            window_ms: config.window_ms,
            window_start: config.window_start(now),
            retry_after_ms: config.retry_after_ms(now),
            unavailable: false,
        }
    }

    /// Denial used when the limiter could not be consulted. Waits a full window.
    pub fn fail_closed(config: &RateLimitConfig, now: u64) -> Self {
        Self {
            allowed: false,
            limit: config.limit,
            remaining: 0,
            window_ms: config.window_ms,
            window_start: config.window_start(now),
            retry_after_ms: config.window_ms,
            unavailable: true,
        }
    }

    /// Allow with the full quota remaining; used when limiting is deliberately off.
    pub fn fail_open(config: &RateLimitConfig, now: u64) -> Self {
        Self {
            allowed: true,
            limit: config.limit,
            remaining: config.limit,
            window_ms: config.window_ms,
            window_start: config.window_start(now),
            retry_after_ms: 0,
            unavailable: false,
        }
    }

    /// `retry-after` value in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1_000)
    }
}

/// A backend that counts admissions for one key within fixed windows.
#[async_trait::async_trait]
pub trait WindowCounter: Send + Sync + std::fmt::Debug {
    /// Count one request against `key` at `now` (epoch milliseconds).
    async fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Result<RateLimitDecision, LimiterError>;
}
