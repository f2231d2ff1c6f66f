//! Configuration for the control plane.
//!
//! Per-action quotas and retry counts are configuration, not code: they live in an
//! [`AuthPolicies`] table held by a [`DynamicConfig`] so they can be replaced at runtime
//! without restarting workers. [`ControlPlaneConfig`] is the serde-facing shape, with every
//! field defaulted and durations in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::action::AuthAction;
use crate::error::ConfigError;
use crate::rate_limit::{CacheFailureMode, RateLimitConfig};

/// Live-updatable shared value with lock-free reads. Clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive a new value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.inner.load_full();
        self.inner.store(Arc::new(f(&current)));
    }
}

/// Quota, retry and timeout settings for one identity-provider action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPolicy {
    quota: RateLimitConfig,
    retries: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl ActionPolicy {
    /// `retries` counts extra attempts after the first. `timeout` bounds each attempt.
    pub fn new(
        quota: RateLimitConfig,
        retries: u32,
        retry_delay: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(timeout));
        }
        Ok(Self { quota, retries, retry_delay, timeout })
    }

    /// Shipped defaults. Password reset and logout retry once; the rest do not.
    pub fn default_for(action: AuthAction) -> Self {
        let (per_minute, retries) = match action {
            AuthAction::Login => (20, 0),
            AuthAction::Signup => (10, 0),
            AuthAction::PasswordReset => (5, 1),
            AuthAction::PasswordChange => (10, 0),
            AuthAction::Logout => (30, 1),
        };
        Self {
            quota: RateLimitConfig::from_parts(per_minute, 60_000),
            retries,
            retry_delay: Duration::from_millis(250),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn quota(&self) -> &RateLimitConfig {
        &self.quota
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Longest one call can keep upstream busy: every attempt timing out, plus the delays
    /// between attempts.
    pub fn worst_case_duration(&self) -> Duration {
        self.timeout
            .saturating_mul(self.max_attempts())
            .saturating_add(self.retry_delay.saturating_mul(self.retries))
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// One [`ActionPolicy`] per [`AuthAction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicies {
    policies: [ActionPolicy; 5],
}

impl Default for AuthPolicies {
    fn default() -> Self {
        Self { policies: AuthAction::ALL.map(ActionPolicy::default_for) }
    }
}

impl AuthPolicies {
    pub fn get(&self, action: AuthAction) -> &ActionPolicy {
        &self.policies[index(action)]
    }

    /// Replace the policy for `action`.
    pub fn with(mut self, action: AuthAction, policy: ActionPolicy) -> Self {
        self.policies[index(action)] = policy;
        self
    }

    /// Errors unless every action's worst-case call ends inside `lease`. A half-open probe
    /// must finish before its claim can be reclaimed by another caller.
    pub fn check_probe_lease(&self, lease: Duration) -> Result<(), ConfigError> {
        AuthAction::ALL.into_iter().try_for_each(|action| {
            let worst_case = self.get(action).worst_case_duration();
            if worst_case >= lease {
                return Err(ConfigError::ProbeOutlivesLease { action, worst_case, lease });
            }
            Ok(())
        })
    }
}

fn index(action: AuthAction) -> usize {
    match action {
        AuthAction::Login => 0,
        AuthAction::Signup => 1,
        AuthAction::PasswordReset => 2,
        AuthAction::PasswordChange => 3,
        AuthAction::Logout => 4,
    }
}

/// Validated circuit breaker settings, shared by the five per-action breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    failure_threshold: u32,
    cooldown: Duration,
    record_ttl: Duration,
    probe_lease: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            record_ttl: Duration::from_secs(600),
            probe_lease: Duration::from_secs(20),
        }
    }
}

impl BreakerConfig {
    /// Errors if the threshold, cooldown or lease is zero, or if records would expire
    /// before an open breaker's cooldown ends.
    pub fn new(
        failure_threshold: u32,
        cooldown: Duration,
        record_ttl: Duration,
        probe_lease: Duration,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(failure_threshold));
        }
        if cooldown.is_zero() {
            return Err(ConfigError::InvalidCooldown(cooldown));
        }
        if record_ttl < cooldown {
            return Err(ConfigError::RecordTtlShorterThanCooldown { ttl: record_ttl, cooldown });
        }
        if probe_lease.is_zero() {
            return Err(ConfigError::InvalidProbeLease(probe_lease));
        }
        Ok(Self { failure_threshold, cooldown, record_ttl, probe_lease })
    }

    /// Consecutive failures that open a closed breaker.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Time an open breaker refuses calls before allowing a probe.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Expiry of persisted breaker records.
    pub fn record_ttl(&self) -> Duration {
        self.record_ttl
    }

    /// How long a half-open probe claim is honored before it counts as abandoned.
    pub fn probe_lease(&self) -> Duration {
        self.probe_lease
    }
}

/// Serde shape of the whole control plane configuration.
///
/// ```
/// use quotaguard::config::ControlPlaneConfig;
///
/// let cfg = ControlPlaneConfig::from_json_str(
///     r#"{ "breaker": { "failure_threshold": 3 }, "actions": { "login": { "retries": 2 } } }"#,
/// )
/// .unwrap();
/// let policies = cfg.auth_policies().unwrap();
/// assert_eq!(policies.get(quotaguard::AuthAction::Login).retries(), 2);
/// assert_eq!(cfg.breaker_config().unwrap().failure_threshold(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlPlaneConfig {
    /// Bound on each call to the actor tier.
    pub actor_timeout_ms: u64,
    /// What the façade does when the shared cache errors.
    pub cache_failure_mode: CacheFailureMode,
    pub breaker: BreakerSettings,
    pub actions: ActionTable,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            actor_timeout_ms: 1_000,
            cache_failure_mode: CacheFailureMode::default(),
            breaker: BreakerSettings::default(),
            actions: ActionTable::default(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn actor_timeout(&self) -> Duration {
        Duration::from_millis(self.actor_timeout_ms)
    }

    pub fn breaker_config(&self) -> Result<BreakerConfig, ConfigError> {
        let b = &self.breaker;
        BreakerConfig::new(
            b.failure_threshold,
            Duration::from_millis(b.cooldown_ms),
            Duration::from_millis(b.record_ttl_ms),
            Duration::from_millis(b.probe_lease_ms),
        )
    }

    /// Validated breaker settings and policy table, checked against each other.
    pub fn validate(&self) -> Result<(BreakerConfig, AuthPolicies), ConfigError> {
        let breaker = self.breaker_config()?;
        let policies = self.auth_policies()?;
        policies.check_probe_lease(breaker.probe_lease())?;
        Ok((breaker, policies))
    }

    /// Shipped defaults with the configured overrides applied.
    pub fn auth_policies(&self) -> Result<AuthPolicies, ConfigError> {
        AuthAction::ALL.into_iter().try_fold(AuthPolicies::default(), |table, action| {
            let policy = self.actions.get(action).apply(ActionPolicy::default_for(action))?;
            Ok(table.with(action, policy))
        })
    }
}

/// Breaker section; durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub record_ttl_ms: u64,
    pub probe_lease_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let d = BreakerConfig::default();
        Self {
            failure_threshold: d.failure_threshold,
            cooldown_ms: d.cooldown.as_millis() as u64,
            record_ttl_ms: d.record_ttl.as_millis() as u64,
            probe_lease_ms: d.probe_lease.as_millis() as u64,
        }
    }
}

/// Per-action overrides; absent fields keep the shipped default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionOverrides {
    pub limit: Option<u32>,
    pub window_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl ActionOverrides {
    fn apply(&self, base: ActionPolicy) -> Result<ActionPolicy, ConfigError> {
        let quota = RateLimitConfig::from_millis(
            self.limit.unwrap_or(base.quota.limit()),
            self.window_ms.unwrap_or(base.quota.window_ms()),
        )?;
        ActionPolicy::new(
            quota,
            self.retries.unwrap_or(base.retries),
            self.retry_delay_ms.map(Duration::from_millis).unwrap_or(base.retry_delay),
            self.timeout_ms.map(Duration::from_millis).unwrap_or(base.timeout),
        )
    }
}

/// `actions` section, one optional override block per action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionTable {
    pub login: ActionOverrides,
    pub signup: ActionOverrides,
    pub password_reset: ActionOverrides,
    pub password_change: ActionOverrides,
    pub logout: ActionOverrides,
}

impl ActionTable {
    pub fn get(&self, action: AuthAction) -> &ActionOverrides {
        match action {
            AuthAction::Login => &self.login,
            AuthAction::Signup => &self.signup,
            AuthAction::PasswordReset => &self.password_reset,
            AuthAction::PasswordChange => &self.password_change,
            AuthAction::Logout => &self.logout,
        }
    }
}
