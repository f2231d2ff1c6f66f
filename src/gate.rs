//! End-to-end gating of identity-provider calls.
//!
//! [`AuthGate::run`] is the whole request path for the five auth actions: network quota,
//! account quota, breaker admission, upstream call with retries, breaker accounting. Every
//! failure comes back as one [`GateError`] for the handler to map with
//! [`status::Response`](crate::status::Response).

use std::future::Future;
use std::sync::Arc;

use crate::action::AuthAction;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::{AuthPolicies, ControlPlaneConfig, DynamicConfig};
use crate::error::{ConfigError, GateError};
use crate::executor::{UpstreamExecutor, UpstreamFailure};
use crate::quota::{AuthAttempt, DualKeyQuota, QuotaVerdict};
use crate::rate_limit::{RateLimiter, WindowCounter};
use crate::store::KvStore;
use crate::telemetry::{NullSink, TelemetrySink};

/// Quota, breaker and executor for the auth routes, sharing one policy table.
#[derive(Clone, Debug)]
pub struct AuthGate<S = NullSink> {
    quota: DualKeyQuota<S>,
    executor: UpstreamExecutor<S>,
    clock: Arc<dyn Clock>,
}

impl AuthGate<NullSink> {
    /// Wire a gate from configuration.
    ///
    /// Counters use the actor tier when present, else the cache. Breakers persist in the
    /// cache when present, else live in process memory. Fails if any action's worst-case
    /// call can outlive the probe lease.
    pub fn from_config(
        actor: Option<Arc<dyn WindowCounter>>,
        cache: Option<Arc<dyn KvStore>>,
        config: &ControlPlaneConfig,
    ) -> Result<Self, ConfigError> {
        let (breaker_config, table) = config.validate()?;
        let policies = DynamicConfig::new(table);
        let breaker = match &cache {
            Some(store) => CircuitBreaker::new(store.clone(), breaker_config),
            None => CircuitBreaker::local(breaker_config),
        };
        let limiter = RateLimiter::from_config(actor, cache, config);
        Ok(Self::new(
            DualKeyQuota::new(limiter, policies.clone()),
            UpstreamExecutor::new(breaker, policies),
        ))
    }
}

impl<S: TelemetrySink> AuthGate<S> {
    pub fn new(quota: DualKeyQuota<S>, executor: UpstreamExecutor<S>) -> Self {
        Self { quota, executor, clock: Arc::new(SystemClock) }
    }

    /// Clock used to place quota checks in their window.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn quota(&self) -> &DualKeyQuota<S> {
        &self.quota
    }

    pub fn executor(&self) -> &UpstreamExecutor<S> {
        &self.executor
    }

    pub fn breaker(&self) -> &CircuitBreaker<S> {
        self.executor.breaker()
    }

    /// Policy table shared by the quota and the executor; updates apply to both.
    pub fn policies(&self) -> &DynamicConfig<AuthPolicies> {
        self.executor.policies()
    }

    /// Checked live update of the shared policy table.
    pub fn set_policies(&self, table: AuthPolicies) -> Result<(), ConfigError> {
        self.executor.set_policies(table)
    }

    /// Gate one `action` attempt and, if admitted, call upstream through `op`.
    pub async fn run<T, E, F, Fut>(
        &self,
        action: AuthAction,
        attempt: &AuthAttempt,
        op: F,
    ) -> Result<T, GateError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UpstreamFailure<E>>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let now = self.clock.now_millis();
        if let QuotaVerdict::Denied { decision, .. } = self.quota.check(action, attempt, now).await {
            let retry_after_ms = decision.retry_after_ms;
            return Err(if decision.unavailable {
                GateError::LimiterUnavailable { retry_after_ms }
            } else {
                GateError::RateLimited { retry_after_ms }
            });
        }
        self.executor.execute(action, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::ActorCounter;
    use crate::store::InMemoryKvStore;

    #[tokio::test]
    async fn from_config_wires_shared_policies() {
        let config = ControlPlaneConfig::from_json_str(
            r#"{ "actions": { "login": { "limit": 1, "window_ms": 60000 } } }"#,
        )
        .unwrap();
        let actor: Arc<dyn WindowCounter> = Arc::new(ActorCounter::new());
        let cache: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let gate = AuthGate::from_config(Some(actor), Some(cache), &config)
            .unwrap()
            .with_clock(ManualClock::new(0));

        let attempt = AuthAttempt::new("192.0.2.1").with_account("bob@example.com");
        let ok = gate
            .run(AuthAction::Login, &attempt, || async { Ok::<_, UpstreamFailure<()>>("token") })
            .await;
        assert_eq!(ok.unwrap(), "token");

        let denied = gate
            .run(AuthAction::Login, &attempt, || async { Ok::<_, UpstreamFailure<()>>("token") })
            .await
            .unwrap_err();
        assert!(matches!(denied, GateError::RateLimited { retry_after_ms: 60_000 }));
    }

    #[test]
    fn from_config_rejects_invalid_breaker_settings() {
        let config =
            ControlPlaneConfig::from_json_str(r#"{ "breaker": { "failure_threshold": 0 } }"#)
                .unwrap();
        assert_eq!(
            AuthGate::from_config(None, None, &config).unwrap_err(),
            ConfigError::InvalidFailureThreshold(0)
        );
    }
}
