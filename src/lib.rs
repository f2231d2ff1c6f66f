#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotaguard
//!
//! Request-gating control plane: fixed-window rate limits and persisted circuit breakers for
//! calls to a remote identity provider.
//!
//! ## Features
//!
//! - **Fixed-window rate limiting** with a strongly consistent per-key actor tier and a
//!   best-effort shared-cache fallback behind one façade
//! - **Fail-closed by default** when the limiter itself is unreachable
//! - **Dual-key quotas** on network address and account, both hashed
//! - **Persisted circuit breakers** per auth action, with a leased single half-open probe
//! - **Upstream executor** with per-attempt timeouts and per-action retry counts
//! - **tower middleware** and HTTP status mapping
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use quotaguard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let actor: Arc<dyn WindowCounter> = Arc::new(ActorCounter::new());
//!     let gate = AuthGate::from_config(Some(actor), None, &ControlPlaneConfig::default()).unwrap();
//!
//!     let attempt = AuthAttempt::new("203.0.113.9").with_account("ada@example.com");
//!     let result = gate
//!         .run(AuthAction::Login, &attempt, || async {
//!             // call the identity provider here
//!             Ok::<_, UpstreamFailure<String>>("session-token")
//!         })
//!         .await;
//!
//!     match result {
//!         Ok(token) => assert_eq!(token, "session-token"),
//!         Err(err) => {
//!             let response = Response::from_error(&err);
//!             println!("{} {}", response.status, response.message);
//!         }
//!     }
//! }
//! ```

pub mod action;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod key;
pub mod prelude;
pub mod quota;
pub mod rate_limit;
pub mod sleeper;
pub mod status;
pub mod store;
pub mod telemetry;

// Re-exports
pub use action::AuthAction;
pub use circuit_breaker::{CircuitBreaker, CircuitDecision, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ActionPolicy, AuthPolicies, BreakerConfig, ControlPlaneConfig, DynamicConfig};
pub use error::{ConfigError, GateError, LimiterError, StoreError};
pub use executor::{UpstreamExecutor, UpstreamFailure};
pub use gate::AuthGate;
pub use key::{hash_subject, rate_limit_key};
pub use quota::{AuthAttempt, DualKeyQuota, QuotaScope, QuotaVerdict};
pub use rate_limit::{
    check_rate_limit, ActorCounter, CacheFailureMode, CounterBackend, RateLimitConfig,
    RateLimitDecision, RateLimitLayer, RateLimiter, SharedCacheCounter, WindowCounter,
};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use store::{InMemoryKvStore, KvStore};
