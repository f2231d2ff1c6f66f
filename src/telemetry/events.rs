use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

use crate::action::AuthAction;

/// Events emitted by the control plane.
///
/// Rate-limit events carry the already-hashed storage key, never a raw subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Window counter outcomes
    RateLimit(RateLimitEvent),
    /// Breaker transitions
    Circuit(CircuitEvent),
    /// Identity-provider call outcomes
    Upstream(UpstreamEvent),
}

/// Events emitted by the rate limit façade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    Allowed {
        key: String,
        remaining: u32,
    },
    /// Quota exhausted for the current window.
    Denied {
        key: String,
        retry_after_ms: u64,
    },
    /// The counter failed and the façade refused the request.
    Unavailable {
        key: String,
        reason: String,
    },
    /// No limiter is configured, or the cache failed under a fail-open policy.
    FailOpen {
        key: String,
    },
}

/// Events emitted by the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    /// Threshold reached, or a half-open probe failed.
    Opened {
        action: AuthAction,
        consecutive_failures: u32,
        cooldown: Duration,
    },
    /// Cooldown elapsed and a probe slot was claimed.
    HalfOpen {
        action: AuthAction,
    },
    /// A success reset the breaker.
    Closed {
        action: AuthAction,
    },
    /// A caller was turned away because a probe is already in flight.
    ProbeRejected {
        action: AuthAction,
    },
    /// Shared persistence failed; state is process-local until it recovers.
    Degraded {
        action: AuthAction,
        reason: String,
    },
}

/// Events emitted by the upstream executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A transient failure is about to be retried after `delay`.
    Retry {
        action: AuthAction,
        attempt: u32,
        delay: Duration,
    },
    /// One attempt exceeded its timeout.
    TimedOut {
        action: AuthAction,
        attempt: u32,
        timeout: Duration,
    },
    /// Every attempt failed; the breaker was told.
    Exhausted {
        action: AuthAction,
        attempts: u32,
    },
    /// Upstream refused the request itself; not counted against the breaker.
    Rejected {
        action: AuthAction,
        status: u16,
    },
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            ControlEvent::Circuit(event) => write!(f, "Circuit::{}", event),
            ControlEvent::Upstream(event) => write!(f, "Upstream::{}", event),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Allowed { key, remaining } => {
                write!(f, "Allowed({}, remaining={})", key, remaining)
            }
            RateLimitEvent::Denied { key, retry_after_ms } => {
                write!(f, "Denied({}, retry_after={}ms)", key, retry_after_ms)
            }
            RateLimitEvent::Unavailable { key, reason } => {
                write!(f, "Unavailable({}, {})", key, reason)
            }
            RateLimitEvent::FailOpen { key } => write!(f, "FailOpen({})", key),
        }
    }
}

impl fmt::Display for CircuitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitEvent::Opened { action, consecutive_failures, cooldown } => write!(
                f,
                "Opened({}, failures={}, cooldown={:?})",
                action, consecutive_failures, cooldown
            ),
            CircuitEvent::HalfOpen { action } => write!(f, "HalfOpen({})", action),
            CircuitEvent::Closed { action } => write!(f, "Closed({})", action),
            CircuitEvent::ProbeRejected { action } => write!(f, "ProbeRejected({})", action),
            CircuitEvent::Degraded { action, reason } => {
                write!(f, "Degraded({}, {})", action, reason)
            }
        }
    }
}

impl fmt::Display for UpstreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamEvent::Retry { action, attempt, delay } => {
                write!(f, "Retry({}, #{}, delay={:?})", action, attempt, delay)
            }
            UpstreamEvent::TimedOut { action, attempt, timeout } => {
                write!(f, "TimedOut({}, #{}, timeout={:?})", action, attempt, timeout)
            }
            UpstreamEvent::Exhausted { action, attempts } => {
                write!(f, "Exhausted({}, attempts={})", action, attempts)
            }
            UpstreamEvent::Rejected { action, status } => {
                write!(f, "Rejected({}, status={})", action, status)
            }
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

#[cfg(feature = "telemetry-json")]
impl ControlEvent {
    /// Flat JSON object with a `kind` discriminator, for line-oriented sinks.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ControlEvent::RateLimit(r) => match r {
                RateLimitEvent::Allowed { key, remaining } => {
                    json!({ "kind": "rate_limit_allowed", "key": key, "remaining": remaining })
                }
                RateLimitEvent::Denied { key, retry_after_ms } => json!({
                    "kind": "rate_limit_denied",
                    "key": key,
                    "retry_after_ms": retry_after_ms,
                }),
                RateLimitEvent::Unavailable { key, reason } => {
                    json!({ "kind": "rate_limit_unavailable", "key": key, "reason": reason })
                }
                RateLimitEvent::FailOpen { key } => {
                    json!({ "kind": "rate_limit_fail_open", "key": key })
                }
            },
            ControlEvent::Circuit(c) => match c {
                CircuitEvent::Opened { action, consecutive_failures, cooldown } => json!({
                    "kind": "circuit_opened",
                    "action": action.as_str(),
                    "failures": consecutive_failures,
                    "cooldown_ms": clamp_u64(cooldown.as_millis()),
                }),
                CircuitEvent::HalfOpen { action } => {
                    json!({ "kind": "circuit_half_open", "action": action.as_str() })
                }
                CircuitEvent::Closed { action } => {
                    json!({ "kind": "circuit_closed", "action": action.as_str() })
                }
                CircuitEvent::ProbeRejected { action } => {
                    json!({ "kind": "circuit_probe_rejected", "action": action.as_str() })
                }
                CircuitEvent::Degraded { action, reason } => json!({
                    "kind": "circuit_degraded",
                    "action": action.as_str(),
                    "reason": reason,
                }),
            },
            ControlEvent::Upstream(u) => match u {
                UpstreamEvent::Retry { action, attempt, delay } => json!({
                    "kind": "upstream_retry",
                    "action": action.as_str(),
                    "attempt": attempt,
                    "delay_ms": clamp_u64(delay.as_millis()),
                }),
                UpstreamEvent::TimedOut { action, attempt, timeout } => json!({
                    "kind": "upstream_timeout",
                    "action": action.as_str(),
                    "attempt": attempt,
                    "timeout_ms": clamp_u64(timeout.as_millis()),
                }),
                UpstreamEvent::Exhausted { action, attempts } => json!({
                    "kind": "upstream_exhausted",
                    "action": action.as_str(),
                    "attempts": attempts,
                }),
                UpstreamEvent::Rejected { action, status } => json!({
                    "kind": "upstream_rejected",
                    "action": action.as_str(),
                    "status": status,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_namespaced() {
        let event = ControlEvent::Circuit(CircuitEvent::Opened {
            action: AuthAction::Login,
            consecutive_failures: 3,
            cooldown: Duration::from_secs(30),
        });
        assert_eq!(event.to_string(), "Circuit::Opened(login, failures=3, cooldown=30s)");

        let event = ControlEvent::RateLimit(RateLimitEvent::Denied {
            key: "rate_limit:auth:abc:login".into(),
            retry_after_ms: 900,
        });
        assert!(event.to_string().starts_with("RateLimit::Denied("));
    }
}

#[cfg(all(test, feature = "telemetry-json"))]
mod json_tests {
    use super::*;

    #[test]
    fn circuit_opened_json() {
        let v = ControlEvent::Circuit(CircuitEvent::Opened {
            action: AuthAction::PasswordReset,
            consecutive_failures: 4,
            cooldown: Duration::from_millis(1_500),
        })
        .to_json();
        assert_eq!(v["kind"], "circuit_opened");
        assert_eq!(v["action"], "password_reset");
        assert_eq!(v["failures"], 4);
        assert_eq!(v["cooldown_ms"], 1_500);
    }

    #[test]
    fn upstream_retry_json() {
        let v = ControlEvent::Upstream(UpstreamEvent::Retry {
            action: AuthAction::Logout,
            attempt: 1,
            delay: Duration::from_millis(250),
        })
        .to_json();
        assert_eq!(v["kind"], "upstream_retry");
        assert_eq!(v["delay_ms"], 250);
    }

    #[test]
    fn rate_limit_denied_json() {
        let v = ControlEvent::RateLimit(RateLimitEvent::Denied {
            key: "rate_limit:feed:x:read".into(),
            retry_after_ms: 9_000,
        })
        .to_json();
        assert_eq!(v["kind"], "rate_limit_denied");
        assert_eq!(v["retry_after_ms"], 9_000);
    }
}
