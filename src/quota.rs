//! Dual-key quotas for identity-provider actions.
//!
//! Every attempt is counted twice: once against the caller's network address and once
//! against the target account. Spreading attempts over many accounts from one address is
//! capped by the first, hammering one account from many addresses by the second.
//!
//! Both subjects are hashed with [`hash_subject`] before they reach a key, so neither the
//! counter store nor the logs ever see a raw address or account identifier.

use tracing::debug;

use crate::action::AuthAction;
use crate::config::{AuthPolicies, DynamicConfig};
use crate::key::{hash_subject, rate_limit_key};
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::telemetry::{NullSink, TelemetrySink};

/// Key namespace for network-scoped counters.
pub const NETWORK_NAMESPACE: &str = "auth_ip";
/// Key namespace for account-scoped counters.
pub const ACCOUNT_NAMESPACE: &str = "auth_account";

const UNKNOWN_ADDR: &str = "unknown";

/// The identifying parts of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    network_addr: String,
    account: Option<String>,
}

impl AuthAttempt {
    /// An attempt from `network_addr` with no account known yet.
    ///
    /// A blank address is counted under a shared `unknown` subject.
    pub fn new(network_addr: impl AsRef<str>) -> Self {
        let addr = network_addr.as_ref().trim();
        let network_addr = if addr.is_empty() { UNKNOWN_ADDR } else { addr };
        Self { network_addr: network_addr.to_string(), account: None }
    }

    /// Attach the target account. Emails and similar identifiers are compared
    /// case-insensitively; a blank identifier leaves the attempt without an account.
    pub fn with_account(mut self, account: impl AsRef<str>) -> Self {
        let normalized = account.as_ref().trim().to_lowercase();
        self.account = (!normalized.is_empty()).then_some(normalized);
        self
    }

    pub fn network_addr(&self) -> &str {
        &self.network_addr
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    /// Hashed network-scoped key for `action`.
    pub fn network_key(&self, action: AuthAction) -> String {
        rate_limit_key(NETWORK_NAMESPACE, &hash_subject(&self.network_addr), action.as_str())
    }

    /// Hashed account-scoped key for `action`, if an account is known.
    pub fn account_key(&self, action: AuthAction) -> Option<String> {
        self.account
            .as_deref()
            .map(|account| rate_limit_key(ACCOUNT_NAMESPACE, &hash_subject(account), action.as_str()))
    }
}

/// Which of the two counters produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Network,
    Account,
}

/// Combined result of the two checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaVerdict {
    /// Both checks passed. `account` is `None` when no account was known.
    Allowed { network: RateLimitDecision, account: Option<RateLimitDecision> },
    /// The first check to deny; the other was not counted.
    Denied { scope: QuotaScope, decision: RateLimitDecision },
}

impl QuotaVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaVerdict::Allowed { .. })
    }

    /// The denying decision, if any.
    pub fn denial(&self) -> Option<(QuotaScope, &RateLimitDecision)> {
        match self {
            QuotaVerdict::Denied { scope, decision } => Some((*scope, decision)),
            QuotaVerdict::Allowed { .. } => None,
        }
    }
}

/// Runs the network check, then the account check, against the per-action quota.
#[derive(Clone, Debug)]
pub struct DualKeyQuota<S = NullSink> {
    limiter: RateLimiter<S>,
    policies: DynamicConfig<AuthPolicies>,
}

impl<S: TelemetrySink> DualKeyQuota<S> {
    pub fn new(limiter: RateLimiter<S>, policies: DynamicConfig<AuthPolicies>) -> Self {
        Self { limiter, policies }
    }

    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    /// Count `attempt` against both quotas for `action` at `now`.
    ///
    /// A network denial returns immediately without touching the account counter.
    pub async fn check(&self, action: AuthAction, attempt: &AuthAttempt, now: u64) -> QuotaVerdict {
        let policies = self.policies.get();
        let quota = policies.get(action).quota();

        let network_key = attempt.network_key(action);
        let network = self.limiter.check(&network_key, quota, now).await;
        if !network.allowed {
            debug!(
                target: "quotaguard::quota",
                %action,
                key = %network_key,
                retry_after_ms = network.retry_after_ms,
                "network quota denied"
            );
            return QuotaVerdict::Denied { scope: QuotaScope::Network, decision: network };
        }

        let Some(account_key) = attempt.account_key(action) else {
            return QuotaVerdict::Allowed { network, account: None };
        };
        let account = self.limiter.check(&account_key, quota, now).await;
        if !account.allowed {
            debug!(
                target: "quotaguard::quota",
                %action,
                key = %account_key,
                retry_after_ms = account.retry_after_ms,
                "account quota denied"
            );
            return QuotaVerdict::Denied { scope: QuotaScope::Account, decision: account };
        }
        QuotaVerdict::Allowed { network, account: Some(account) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActionPolicy;
    use crate::rate_limit::{ActorCounter, CounterBackend, RateLimitConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn quota_with_limit(limit: u32) -> DualKeyQuota {
        let policy = ActionPolicy::new(
            RateLimitConfig::from_millis(limit, 60_000).unwrap(),
            0,
            Duration::from_millis(250),
            Duration::from_secs(5),
        )
        .unwrap();
        let policies = AuthPolicies::default().with(AuthAction::Login, policy);
        DualKeyQuota::new(
            RateLimiter::new(CounterBackend::Actor(Arc::new(ActorCounter::new()))),
            DynamicConfig::new(policies),
        )
    }

    #[test]
    fn keys_never_embed_raw_subjects() {
        let attempt = AuthAttempt::new("203.0.113.7").with_account("  Alice@Example.com ");
        assert_eq!(attempt.account(), Some("alice@example.com"));
        let network = attempt.network_key(AuthAction::Login);
        let account = attempt.account_key(AuthAction::Login).unwrap();
        assert!(network.starts_with("rate_limit:auth_ip:"));
        assert!(network.ends_with(":login"));
        assert!(!network.contains("203.0.113.7"));
        assert!(!account.contains("alice"));
        assert_eq!(
            account,
            AuthAttempt::new("198.51.100.1")
                .with_account("alice@example.com")
                .account_key(AuthAction::Login)
                .unwrap()
        );
    }

    #[test]
    fn blank_inputs_normalize() {
        let attempt = AuthAttempt::new("  ").with_account("   ");
        assert_eq!(attempt.network_addr(), "unknown");
        assert_eq!(attempt.account(), None);
        assert_eq!(attempt.account_key(AuthAction::Signup), None);
    }

    #[tokio::test]
    async fn network_denial_skips_account_counter() {
        let quota = quota_with_limit(1);
        let first = AuthAttempt::new("10.0.0.1").with_account("a@example.com");
        let second = AuthAttempt::new("10.0.0.1").with_account("b@example.com");

        assert!(quota.check(AuthAction::Login, &first, 1_000).await.is_allowed());
        let verdict = quota.check(AuthAction::Login, &second, 1_000).await;
        let (scope, decision) = verdict.denial().unwrap();
        assert_eq!(scope, QuotaScope::Network);
        assert_eq!(decision.retry_after_ms, 59_000);

        // b@example.com was never counted, so it passes from a fresh address.
        let elsewhere = AuthAttempt::new("10.0.0.2").with_account("b@example.com");
        assert!(quota.check(AuthAction::Login, &elsewhere, 1_000).await.is_allowed());
    }

    #[tokio::test]
    async fn account_quota_caps_distributed_addresses() {
        let quota = quota_with_limit(2);
        for i in 0..2 {
            let attempt = AuthAttempt::new(format!("10.0.1.{i}")).with_account("victim@example.com");
            assert!(quota.check(AuthAction::Login, &attempt, 0).await.is_allowed());
        }
        let attempt = AuthAttempt::new("10.0.1.99").with_account("victim@example.com");
        let verdict = quota.check(AuthAction::Login, &attempt, 0).await;
        assert_eq!(verdict.denial().map(|(scope, _)| scope), Some(QuotaScope::Account));
    }

    #[tokio::test]
    async fn actions_count_separately() {
        let quota = quota_with_limit(1);
        let attempt = AuthAttempt::new("10.0.0.1");
        assert!(quota.check(AuthAction::Login, &attempt, 0).await.is_allowed());
        assert!(!quota.check(AuthAction::Login, &attempt, 0).await.is_allowed());
        assert!(quota.check(AuthAction::Logout, &attempt, 0).await.is_allowed());
    }
}
