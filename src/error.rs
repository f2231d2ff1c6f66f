//! Error types for the control plane.
//!
//! [`GateError`] is the one shape route handlers branch on. The lower-level errors
//! ([`LimiterError`], [`StoreError`]) stay inside the façade and the breaker, which turn
//! them into decisions instead of letting them escape.
use std::time::Duration;

use crate::action::AuthAction;

/// Invalid configuration values, rejected when a config is built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("limit must be > 0 (got {0})")]
    InvalidLimit(u32),
    #[error("window must be at least 1ms (got {0:?})")]
    InvalidWindow(Duration),
    #[error("failure_threshold must be > 0 (got {0})")]
    InvalidFailureThreshold(u32),
    #[error("cooldown must be > 0 (got {0:?})")]
    InvalidCooldown(Duration),
    #[error("record_ttl ({ttl:?}) must be >= cooldown ({cooldown:?})")]
    RecordTtlShorterThanCooldown { ttl: Duration, cooldown: Duration },
    #[error("probe_lease must be > 0 (got {0:?})")]
    InvalidProbeLease(Duration),
    #[error("upstream timeout must be > 0 (got {0:?})")]
    InvalidTimeout(Duration),
    /// A call for `action` can still be running when its half-open probe claim expires.
    #[error("{action} calls can run for {worst_case:?}, which is not inside probe_lease ({lease:?})")]
    ProbeOutlivesLease { action: AuthAction, worst_case: Duration, lease: Duration },
    #[error("invalid control plane config: {0}")]
    Parse(String),
}

/// Failures of the shared key-value cache.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The cache could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A record could not be encoded or decoded.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failures of a window counter.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// Non-positive limit or window reached the counter.
    #[error("invalid rate limit request: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// The counter could not be reached.
    #[error("window counter unavailable: {0}")]
    Unavailable(String),
    /// The counter answered with something unusable. Raised by out-of-process counter
    /// implementations whose replies fail to decode.
    #[error("malformed window counter response: {0}")]
    Malformed(String),
    /// The counter did not answer in time.
    #[error("window counter did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Unified failure shape returned to route handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError<E> {
    /// Request was unusable; rejected before any quota was spent.
    #[error("malformed request: {0}")]
    BadRequest(String),
    /// Quota exceeded.
    #[error("rate limit exceeded; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    /// The limiter could not decide; the request is refused rather than let through.
    #[error("rate limiter unavailable; retry after {retry_after_ms}ms")]
    LimiterUnavailable { retry_after_ms: u64 },
    /// The breaker for `action` refused the call before any upstream attempt.
    #[error("circuit open for {action}; retry after {retry_after_ms}ms")]
    CircuitOpen { action: AuthAction, retry_after_ms: u64 },
    /// Upstream kept failing with server or transport errors until retries ran out.
    #[error("upstream {action} failed after {attempts} attempt(s) (status {status:?})")]
    UpstreamServer { action: AuthAction, attempts: u32, status: Option<u16> },
    /// The final upstream attempt exceeded its timeout.
    #[error("upstream {action} timed out after {attempts} attempt(s) (limit {timeout:?})")]
    UpstreamTimeout { action: AuthAction, attempts: u32, timeout: Duration },
    /// Upstream refused the request itself (4xx); surfaced as-is.
    #[error("upstream rejected request with status {status}: {error}")]
    Rejected { status: u16, error: E },
    /// Error from a wrapped inner service.
    #[error("{0}")]
    Inner(E),
}

impl<E> GateError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_limiter_unavailable(&self) -> bool {
        matches!(self, Self::LimiterUnavailable { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::UpstreamTimeout { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Suggested wait before retrying, for the variants that carry one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms }
            | Self::LimiterUnavailable { retry_after_ms }
            | Self::CircuitOpen { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Take the caller-facing error out of `Rejected` or `Inner`.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Rejected { error, .. } | Self::Inner(error) => Some(error),
            _ => None,
        }
    }

    /// Convert the payload type, leaving the control-plane variants untouched.
    pub fn map_inner<F, E2>(self, f: F) -> GateError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::BadRequest(msg) => GateError::BadRequest(msg),
            Self::RateLimited { retry_after_ms } => GateError::RateLimited { retry_after_ms },
            Self::LimiterUnavailable { retry_after_ms } => {
                GateError::LimiterUnavailable { retry_after_ms }
            }
            Self::CircuitOpen { action, retry_after_ms } => {
                GateError::CircuitOpen { action, retry_after_ms }
            }
            Self::UpstreamServer { action, attempts, status } => {
                GateError::UpstreamServer { action, attempts, status }
            }
            Self::UpstreamTimeout { action, attempts, timeout } => {
                GateError::UpstreamTimeout { action, attempts, timeout }
            }
            Self::Rejected { status, error } => GateError::Rejected { status, error: f(error) },
            Self::Inner(error) => GateError::Inner(f(error)),
        }
    }
}
