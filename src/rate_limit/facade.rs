//! Rate Limit Façade: the single entry point every gated route calls.
//!
//! Backend selection happens once, from configuration:
//!
//! | actor tier | shared cache | backend |
//! |---|---|---|
//! | present | any | [`CounterBackend::Actor`] |
//! | absent | present | [`CounterBackend::SharedCache`] |
//! | absent | absent | [`CounterBackend::Disabled`] |
//!
//! Failure policy per backend:
//! - **Actor**: any failure (unreachable, malformed reply, timeout) is a denial with
//!   `retry_after_ms = window_ms`. An unreachable limiter never grants unlimited access.
//! - **SharedCache**: a cache failure follows the configured [`CacheFailureMode`].
//! - **Disabled**: every request is allowed with the full quota remaining. This is the
//!   deliberate setting for environments where rate limiting is switched off.
//!
//! Errors never escape: every path yields a [`RateLimitDecision`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{RateLimitConfig, RateLimitDecision, SharedCacheCounter, WindowCounter};
use crate::clock::{Clock, SystemClock};
use crate::config::ControlPlaneConfig;
use crate::error::LimiterError;
use crate::store::KvStore;
use crate::telemetry::{emit, ControlEvent, NullSink, RateLimitEvent, TelemetrySink};

/// Default bound on a single actor call.
pub const DEFAULT_ACTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// What to do when the shared cache cannot be read or written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheFailureMode {
    /// Deny with `retry_after_ms = window_ms`.
    #[default]
    FailClosed,
    /// Allow with the full quota remaining.
    FailOpen,
}

/// The counting strategy injected into the façade.
#[derive(Clone, Debug)]
pub enum CounterBackend {
    /// Strongly consistent per-key actors.
    Actor(Arc<dyn WindowCounter>),
    /// Best-effort counting in a shared cache.
    SharedCache(SharedCacheCounter),
    /// Rate limiting switched off.
    Disabled,
}

impl CounterBackend {
    /// Prefer the actor tier, then the cache, then nothing.
    pub fn select(actor: Option<Arc<dyn WindowCounter>>, cache: Option<Arc<dyn KvStore>>) -> Self {
        match (actor, cache) {
            (Some(actor), _) => CounterBackend::Actor(actor),
            (None, Some(cache)) => CounterBackend::SharedCache(SharedCacheCounter::new(cache)),
            (None, None) => CounterBackend::Disabled,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CounterBackend::Actor(_) => "actor",
            CounterBackend::SharedCache(_) => "shared_cache",
            CounterBackend::Disabled => "disabled",
        }
    }
}

/// Rate limit façade. Cheap to clone; clones share the backend.
#[derive(Clone, Debug)]
pub struct RateLimiter<S = NullSink> {
    backend: CounterBackend,
    cache_failure: CacheFailureMode,
    actor_timeout: Duration,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl RateLimiter<NullSink> {
    pub fn new(backend: CounterBackend) -> Self {
        Self {
            backend,
            cache_failure: CacheFailureMode::default(),
            actor_timeout: DEFAULT_ACTOR_TIMEOUT,
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }

    /// Select the backend and apply the façade settings from `config`.
    pub fn from_config(
        actor: Option<Arc<dyn WindowCounter>>,
        cache: Option<Arc<dyn KvStore>>,
        config: &ControlPlaneConfig,
    ) -> Self {
        Self::new(CounterBackend::select(actor, cache))
            .with_cache_failure_mode(config.cache_failure_mode)
            .with_actor_timeout(config.actor_timeout())
    }
}

impl<S: TelemetrySink> RateLimiter<S> {
    /// Route decisions into `sink`.
    pub fn with_sink<S2: TelemetrySink>(self, sink: S2) -> RateLimiter<S2> {
        RateLimiter {
            backend: self.backend,
            cache_failure: self.cache_failure,
            actor_timeout: self.actor_timeout,
            clock: self.clock,
            sink,
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_cache_failure_mode(mut self, mode: CacheFailureMode) -> Self {
        self.cache_failure = mode;
        self
    }

    /// Bound each actor call; a zero duration keeps the current bound.
    pub fn with_actor_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.actor_timeout = timeout;
        }
        self
    }

    pub fn backend(&self) -> &CounterBackend {
        &self.backend
    }

    /// Count one request against `key` at `now` (epoch milliseconds).
    pub async fn check(&self, key: &str, config: &RateLimitConfig, now: u64) -> RateLimitDecision {
        let decision = match &self.backend {
            CounterBackend::Actor(counter) => {
                let outcome =
                    match tokio::time::timeout(self.actor_timeout, counter.check(key, config, now))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(LimiterError::Timeout(self.actor_timeout)),
                    };
                match outcome {
                    Ok(decision) => decision,
                    Err(err) => return self.fail_closed(key, config, now, &err).await,
                }
            }
            CounterBackend::SharedCache(counter) => match counter.check(key, config, now).await {
                Ok(decision) => decision,
                Err(err) => {
                    return match self.cache_failure {
                        CacheFailureMode::FailClosed => {
                            self.fail_closed(key, config, now, &err).await
                        }
                        CacheFailureMode::FailOpen => {
                            warn!(
                                target: "quotaguard::rate_limit",
                                key,
                                error = %err,
                                "shared cache failed; allowing request (fail open)"
                            );
                            self.fail_open(key, config, now).await
                        }
                    }
                }
            },
            CounterBackend::Disabled => return self.fail_open(key, config, now).await,
        };

        let event = if decision.allowed {
            RateLimitEvent::Allowed { key: key.to_string(), remaining: decision.remaining }
        } else {
            debug!(
                target: "quotaguard::rate_limit",
                key,
                limit = decision.limit,
                retry_after_ms = decision.retry_after_ms,
                backend = self.backend.name(),
                "rate limit exceeded"
            );
            RateLimitEvent::Denied { key: key.to_string(), retry_after_ms: decision.retry_after_ms }
        };
        emit(&self.sink, ControlEvent::RateLimit(event)).await;
        decision
    }

    /// [`check`](Self::check) at the limiter's own clock.
    pub async fn check_now(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.check(key, config, self.clock.now_millis()).await
    }

    async fn fail_closed(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
        err: &LimiterError,
    ) -> RateLimitDecision {
        warn!(
            target: "quotaguard::rate_limit",
            key,
            backend = self.backend.name(),
            error = %err,
            "window counter failed; denying request"
        );
        let event = RateLimitEvent::Unavailable { key: key.to_string(), reason: err.to_string() };
        emit(&self.sink, ControlEvent::RateLimit(event)).await;
        RateLimitDecision::fail_closed(config, now)
    }

    async fn fail_open(&self, key: &str, config: &RateLimitConfig, now: u64) -> RateLimitDecision {
        let event = RateLimitEvent::FailOpen { key: key.to_string() };
        emit(&self.sink, ControlEvent::RateLimit(event)).await;
        RateLimitDecision::fail_open(config, now)
    }
}

/// One-shot form of the façade: pick the backend from what is provisioned and check.
///
/// Uses the default fail-closed policy for cache failures.
pub async fn check_rate_limit(
    cache: Option<Arc<dyn KvStore>>,
    key: &str,
    config: &RateLimitConfig,
    now: u64,
    actor: Option<Arc<dyn WindowCounter>>,
) -> RateLimitDecision {
    RateLimiter::new(CounterBackend::select(actor, cache)).check(key, config, now).await
}
