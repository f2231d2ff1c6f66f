//! Convenient re-exports for common quotaguard types.
pub use crate::{
    action::AuthAction,
    circuit_breaker::{CircuitBreaker, CircuitDecision, CircuitState},
    config::{ActionPolicy, AuthPolicies, BreakerConfig, ControlPlaneConfig, DynamicConfig},
    error::{GateError, LimiterError},
    executor::{UpstreamExecutor, UpstreamFailure},
    gate::AuthGate,
    quota::{AuthAttempt, DualKeyQuota, QuotaVerdict},
    rate_limit::{
        check_rate_limit, ActorCounter, CacheFailureMode, CounterBackend, RateLimitConfig,
        RateLimitDecision, RateLimitLayer, RateLimiter, WindowCounter,
    },
    status::Response,
    store::{InMemoryKvStore, KvStore},
    telemetry::{ControlEvent, LogSink, MemorySink, NullSink, TelemetrySink},
};
