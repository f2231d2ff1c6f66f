//! Persisted circuit breaker, one per [`AuthAction`].
//!
//! State lives in the shared [`KvStore`] under `auth:circuit:{action}` so every worker
//! observes the same logical breaker. Each operation is read, mutate, write; the store has
//! no compare-and-set, so races at the exact cooldown boundary are tolerated.
//!
//! # States
//! - **Closed**: calls always attempted. Failures count up; a success resets the count.
//! - **Open**: calls refused until `next_retry_at`. Once that passes the record *reads* as
//!   half-open; nothing runs in the background.
//! - **HalfOpen**: one probe at a time. The claim carries a `probe_id` and a
//!   `probe_claimed_at` lease; a claim older than [`BreakerConfig::probe_lease`] counts as
//!   abandoned and the next caller may take it over.
//!
//! A caller that persists a claim re-reads the record and only proceeds if its own
//! `probe_id` is stored, so the first persisted claim wins.
//!
//! Records carry [`RECORD_VERSION`]. Anything else, or anything unreadable, is discarded and
//! read as closed.
//!
//! If the store fails, the breaker keeps going on process-local state (a map seeded with
//! whatever this process last wrote). That state is correct within one process only; the
//! switch is logged at `warn` and emitted as [`CircuitEvent::Degraded`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::AuthAction;
use crate::clock::{Clock, SystemClock};
use crate::config::BreakerConfig;
use crate::error::StoreError;
use crate::key::circuit_key;
use crate::store::KvStore;
use crate::telemetry::{emit, CircuitEvent, ControlEvent, NullSink, TelemetrySink};

/// Schema version written into every record.
pub const RECORD_VERSION: u32 = 1;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// The persisted breaker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRecord {
    pub version: u32,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub opened_at: Option<u64>,
    #[serde(default)]
    pub next_retry_at: Option<u64>,
    #[serde(default)]
    pub half_open_in_flight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_claimed_at: Option<u64>,
    pub updated_at: u64,
}

/// What an admission check should do with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allow,
    Cooling { retry_after_ms: u64 },
    ProbeBusy { retry_after_ms: u64 },
    Claim { reclaimed: bool },
}

/// Effect of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureOutcome {
    Counted,
    Opened,
    Reopened,
}

impl CircuitRecord {
    pub fn closed(now: u64) -> Self {
        Self {
            version: RECORD_VERSION,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_retry_at: None,
            half_open_in_flight: false,
            probe_id: None,
            probe_claimed_at: None,
            updated_at: now,
        }
    }

    /// Parse a stored record. Unreadable records and other schema versions read as closed.
    pub fn decode(raw: &str, now: u64) -> Self {
        match serde_json::from_str::<CircuitRecord>(raw) {
            Ok(record) if record.version == RECORD_VERSION => record,
            Ok(record) => {
                debug!(
                    target: "quotaguard::circuit_breaker",
                    found = record.version,
                    expected = RECORD_VERSION,
                    "discarding breaker record with foreign schema version"
                );
                Self::closed(now)
            }
            Err(err) => {
                debug!(target: "quotaguard::circuit_breaker", error = %err, "discarding unreadable breaker record");
                Self::closed(now)
            }
        }
    }

    /// State as observed at `now`; an open breaker past its cooldown reads as half-open.
    pub fn effective_state(&self, now: u64) -> CircuitState {
        match self.state {
            CircuitState::Open if self.cooldown_elapsed(now) => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn cooldown_elapsed(&self, now: u64) -> bool {
        self.next_retry_at.map_or(true, |at| now >= at)
    }

    fn admission(&self, now: u64, lease_ms: u64) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allow,
            CircuitState::Open if !self.cooldown_elapsed(now) => Admission::Cooling {
                retry_after_ms: self.next_retry_at.unwrap_or(now).saturating_sub(now),
            },
            CircuitState::Open => Admission::Claim { reclaimed: false },
            CircuitState::HalfOpen if !self.half_open_in_flight => {
                Admission::Claim { reclaimed: false }
            }
            CircuitState::HalfOpen => {
                let claimed_at = self.probe_claimed_at.unwrap_or(self.updated_at);
                let expires_at = claimed_at.saturating_add(lease_ms);
                if now >= expires_at {
                    Admission::Claim { reclaimed: true }
                } else {
                    Admission::ProbeBusy { retry_after_ms: expires_at - now }
                }
            }
        }
    }

    fn claim(&mut self, probe_id: String, now: u64) {
        self.state = CircuitState::HalfOpen;
        self.half_open_in_flight = true;
        self.probe_id = Some(probe_id);
        self.probe_claimed_at = Some(now);
        self.updated_at = now;
    }

    fn clear_probe(&mut self) {
        self.half_open_in_flight = false;
        self.probe_id = None;
        self.probe_claimed_at = None;
    }

    fn open(&mut self, now: u64, config: &BreakerConfig) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.next_retry_at = Some(now.saturating_add(config.cooldown().as_millis() as u64));
    }

    // A failure while already open leaves the cooldown where it is.
    fn fail(&mut self, now: u64, config: &BreakerConfig) -> FailureOutcome {
        let prior = self.state;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.clear_probe();
        self.updated_at = now;
        match prior {
            CircuitState::HalfOpen => {
                self.open(now, config);
                FailureOutcome::Reopened
            }
            CircuitState::Closed if self.consecutive_failures >= config.failure_threshold() => {
                self.open(now, config);
                FailureOutcome::Opened
            }
            CircuitState::Closed | CircuitState::Open => FailureOutcome::Counted,
        }
    }

    /// Returns true if the breaker was not already closed.
    fn succeed(&mut self, now: u64) -> bool {
        let changed = self.state != CircuitState::Closed;
        *self = Self::closed(now);
        changed
    }
}

/// Result of [`CircuitBreaker::check_circuit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitDecision {
    pub allowed: bool,
    /// Remaining cooldown or probe lease when denied.
    pub retry_after_ms: Option<u64>,
    /// True when this caller holds the half-open probe slot.
    pub probe: bool,
}

impl CircuitDecision {
    fn allow() -> Self {
        Self { allowed: true, retry_after_ms: None, probe: false }
    }

    fn probe() -> Self {
        Self { allowed: true, retry_after_ms: None, probe: true }
    }

    fn deny(retry_after_ms: u64) -> Self {
        Self { allowed: false, retry_after_ms: Some(retry_after_ms), probe: false }
    }

    /// Retry window in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_ms.map(|ms| ms.div_ceil(1_000))
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub action: AuthAction,
    /// Effective state at the time of the snapshot.
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub next_retry_at: Option<u64>,
    pub half_open_in_flight: bool,
    /// True when the store could not be read and local state was reported instead.
    pub degraded: bool,
}

/// The five per-action breakers, backed by a shared store.
///
/// Clones share the process-local fallback state.
#[derive(Clone, Debug)]
pub struct CircuitBreaker<S = NullSink> {
    store: Option<Arc<dyn KvStore>>,
    local: Arc<Mutex<HashMap<AuthAction, CircuitRecord>>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl CircuitBreaker<NullSink> {
    /// Breakers persisted in `store`.
    pub fn new(store: Arc<dyn KvStore>, config: BreakerConfig) -> Self {
        Self::build(Some(store), config)
    }

    /// Breakers kept in process memory only; each process sees its own breaker.
    pub fn local(config: BreakerConfig) -> Self {
        Self::build(None, config)
    }

    fn build(store: Option<Arc<dyn KvStore>>, config: BreakerConfig) -> Self {
        Self {
            store,
            local: Arc::new(Mutex::new(HashMap::new())),
            config,
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl<S: TelemetrySink> CircuitBreaker<S> {
    pub fn with_sink<S2: TelemetrySink>(self, sink: S2) -> CircuitBreaker<S2> {
        CircuitBreaker {
            store: self.store,
            local: self.local,
            config: self.config,
            clock: self.clock,
            sink,
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }

    /// Decide whether a call for `action` may go upstream.
    ///
    /// Open within cooldown: denied with the remaining cooldown. Open past cooldown: the
    /// caller claims the probe slot. Half-open with a live claim: denied. Closed: allowed.
    pub async fn check_circuit(&self, action: AuthAction) -> CircuitDecision {
        let now = self.clock.now_millis();
        let Some(store) = self.store.clone() else {
            return self.check_local(action, now).await;
        };

        let record = match self.read(&store, action, now).await {
            Ok(record) => record,
            Err(err) => {
                self.degrade(action, &err).await;
                return self.check_local(action, now).await;
            }
        };

        match record.admission(now, self.lease_ms()) {
            Admission::Allow => CircuitDecision::allow(),
            Admission::Cooling { retry_after_ms } => {
                debug!(target: "quotaguard::circuit_breaker", %action, retry_after_ms, "circuit open; call refused");
                CircuitDecision::deny(retry_after_ms)
            }
            Admission::ProbeBusy { retry_after_ms } => {
                self.reject_probe(action).await;
                CircuitDecision::deny(retry_after_ms)
            }
            Admission::Claim { reclaimed } => {
                let probe_id = Uuid::new_v4().to_string();
                let mut claimed = record.clone();
                claimed.claim(probe_id.clone(), now);
                if let Err(err) = self.write(&store, action, &claimed).await {
                    self.degrade(action, &err).await;
                    return self.check_local(action, now).await;
                }

                match self.read(&store, action, now).await {
                    Ok(current) if current.probe_id.as_deref() != Some(probe_id.as_str()) => {
                        debug!(target: "quotaguard::circuit_breaker", %action, "lost probe claim to another caller");
                        self.reject_probe(action).await;
                        return CircuitDecision::deny(self.lease_ms());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            target: "quotaguard::circuit_breaker",
                            %action,
                            error = %err,
                            "could not verify probe claim; proceeding with it"
                        );
                    }
                }
                self.probe_admitted(action, &record, reclaimed, now).await;
                CircuitDecision::probe()
            }
        }
    }

    /// Record a failed upstream call for `action`.
    ///
    /// Half-open: the probe failed and the breaker reopens with a fresh cooldown. Closed:
    /// the failure is counted and the breaker opens at the threshold. Always releases the
    /// probe slot.
    pub async fn report_failure(&self, action: AuthAction) {
        let now = self.clock.now_millis();
        let config = self.config;
        let (record, outcome) = self.update(action, now, |record| record.fail(now, &config)).await;

        match outcome {
            FailureOutcome::Counted => {
                debug!(
                    target: "quotaguard::circuit_breaker",
                    %action,
                    consecutive_failures = record.consecutive_failures,
                    "upstream failure recorded"
                );
                return;
            }
            FailureOutcome::Opened => {
                error!(
                    target: "quotaguard::circuit_breaker",
                    %action,
                    consecutive_failures = record.consecutive_failures,
                    cooldown_ms = self.config.cooldown().as_millis() as u64,
                    "circuit opened"
                );
            }
            FailureOutcome::Reopened => {
                warn!(
                    target: "quotaguard::circuit_breaker",
                    %action,
                    cooldown_ms = self.config.cooldown().as_millis() as u64,
                    "half-open probe failed; circuit reopened"
                );
            }
        }
        let event = CircuitEvent::Opened {
            action,
            consecutive_failures: record.consecutive_failures,
            cooldown: self.config.cooldown(),
        };
        emit(&self.sink, ControlEvent::Circuit(event)).await;
    }

    /// Record a successful upstream call: closed, zero failures, no cooldown, probe released.
    pub async fn report_success(&self, action: AuthAction) {
        let now = self.clock.now_millis();
        let (_, changed) = self.update(action, now, |record| record.succeed(now)).await;
        if changed {
            info!(target: "quotaguard::circuit_breaker", %action, "circuit closed");
            emit(&self.sink, ControlEvent::Circuit(CircuitEvent::Closed { action })).await;
        }
    }

    /// Force the breaker for `action` closed.
    pub async fn reset(&self, action: AuthAction) {
        let now = self.clock.now_millis();
        self.update(action, now, |record| *record = CircuitRecord::closed(now)).await;
        info!(target: "quotaguard::circuit_breaker", %action, "circuit reset");
        emit(&self.sink, ControlEvent::Circuit(CircuitEvent::Closed { action })).await;
    }

    /// Current effective state of the breaker for `action`.
    pub async fn snapshot(&self, action: AuthAction) -> CircuitSnapshot {
        let now = self.clock.now_millis();
        let (record, degraded) = match &self.store {
            Some(store) => match self.read(store, action, now).await {
                Ok(record) => (record, false),
                Err(_) => (self.local_record(action, now), true),
            },
            None => (self.local_record(action, now), false),
        };
        CircuitSnapshot {
            action,
            state: record.effective_state(now),
            consecutive_failures: record.consecutive_failures,
            next_retry_at: record.next_retry_at,
            half_open_in_flight: record.half_open_in_flight,
            degraded,
        }
    }

    fn lease_ms(&self) -> u64 {
        self.config.probe_lease().as_millis() as u64
    }

    fn lock_local(&self) -> MutexGuard<'_, HashMap<AuthAction, CircuitRecord>> {
        self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn local_record(&self, action: AuthAction, now: u64) -> CircuitRecord {
        self.lock_local().get(&action).cloned().unwrap_or_else(|| CircuitRecord::closed(now))
    }

    async fn read(
        &self,
        store: &Arc<dyn KvStore>,
        action: AuthAction,
        now: u64,
    ) -> Result<CircuitRecord, StoreError> {
        Ok(match store.get(&circuit_key(action)).await? {
            Some(raw) => CircuitRecord::decode(&raw, now),
            None => CircuitRecord::closed(now),
        })
    }

    async fn write(
        &self,
        store: &Arc<dyn KvStore>,
        action: AuthAction,
        record: &CircuitRecord,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        store.put(&circuit_key(action), raw, self.config.record_ttl()).await?;
        self.lock_local().insert(action, record.clone());
        Ok(())
    }

    /// Apply `f` to the stored record and write it back, falling back to local state.
    async fn update<R, F>(&self, action: AuthAction, now: u64, f: F) -> (CircuitRecord, R)
    where
        F: Fn(&mut CircuitRecord) -> R + Send,
        R: Send,
    {
        if let Some(store) = self.store.clone() {
            match self.read(&store, action, now).await {
                Ok(mut record) => {
                    let out = f(&mut record);
                    match self.write(&store, action, &record).await {
                        Ok(()) => return (record, out),
                        Err(err) => self.degrade(action, &err).await,
                    }
                }
                Err(err) => self.degrade(action, &err).await,
            }
        }

        let mut local = self.lock_local();
        let record = local.entry(action).or_insert_with(|| CircuitRecord::closed(now));
        let out = f(record);
        (record.clone(), out)
    }

    async fn check_local(&self, action: AuthAction, now: u64) -> CircuitDecision {
        let (decision, prior, admission) = {
            let mut local = self.lock_local();
            let record = local.entry(action).or_insert_with(|| CircuitRecord::closed(now));
            let prior = record.clone();
            let admission = record.admission(now, self.lease_ms());
            let decision = match admission {
                Admission::Allow => CircuitDecision::allow(),
                Admission::Cooling { retry_after_ms } | Admission::ProbeBusy { retry_after_ms } => {
                    CircuitDecision::deny(retry_after_ms)
                }
                Admission::Claim { .. } => {
                    record.claim(Uuid::new_v4().to_string(), now);
                    CircuitDecision::probe()
                }
            };
            (decision, prior, admission)
        };

        match admission {
            Admission::ProbeBusy { .. } => self.reject_probe(action).await,
            Admission::Claim { reclaimed } => {
                self.probe_admitted(action, &prior, reclaimed, now).await
            }
            Admission::Allow | Admission::Cooling { .. } => {}
        }
        decision
    }

    async fn probe_admitted(
        &self,
        action: AuthAction,
        prior: &CircuitRecord,
        reclaimed: bool,
        now: u64,
    ) {
        if reclaimed {
            warn!(
                target: "quotaguard::circuit_breaker",
                %action,
                claimed_at = prior.probe_claimed_at.unwrap_or(prior.updated_at),
                now,
                "probe claim outlived its lease; reclaiming"
            );
        }
        info!(target: "quotaguard::circuit_breaker", %action, "circuit half-open; probe admitted");
        emit(&self.sink, ControlEvent::Circuit(CircuitEvent::HalfOpen { action })).await;
    }

    async fn reject_probe(&self, action: AuthAction) {
        debug!(target: "quotaguard::circuit_breaker", %action, "probe already in flight; call refused");
        emit(&self.sink, ControlEvent::Circuit(CircuitEvent::ProbeRejected { action })).await;
    }

    async fn degrade(&self, action: AuthAction, err: &StoreError) {
        warn!(
            target: "quotaguard::circuit_breaker",
            %action,
            error = %err,
            "breaker store unavailable; using process-local state"
        );
        let event = CircuitEvent::Degraded { action, reason: err.to_string() };
        emit(&self.sink, ControlEvent::Circuit(event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryKvStore;
    use crate::telemetry::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn config(threshold: u32) -> BreakerConfig {
        BreakerConfig::new(
            threshold,
            Duration::from_secs(30),
            Duration::from_secs(600),
            Duration::from_secs(20),
        )
        .unwrap()
    }

    fn persisted(threshold: u32, clock: &ManualClock) -> (CircuitBreaker, InMemoryKvStore) {
        let store = InMemoryKvStore::with_clock(clock.clone());
        let breaker = CircuitBreaker::new(Arc::new(store.clone()), config(threshold))
            .with_clock(clock.clone());
        (breaker, store)
    }

    #[derive(Debug)]
    struct DownStore;

    #[async_trait]
    impl KvStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }

        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
    }

    /// Overwrites every half-open claim with a competing one right after it lands.
    #[derive(Debug)]
    struct CompetingClaimStore {
        inner: InMemoryKvStore,
        armed: AtomicBool,
    }

    #[async_trait]
    impl KvStore for CompetingClaimStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
            let mut record: CircuitRecord = serde_json::from_str(&value)?;
            if self.armed.load(Ordering::SeqCst) && record.half_open_in_flight {
                record.probe_id = Some("another-worker".into());
            }
            self.inner.put(key, serde_json::to_string(&record)?, ttl).await
        }
    }

    #[test]
    fn record_uses_camel_case_fields() {
        let raw = serde_json::to_value(CircuitRecord::closed(5)).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["state"], "closed");
        assert_eq!(raw["consecutiveFailures"], 0);
        assert_eq!(raw["halfOpenInFlight"], false);
        assert_eq!(raw["updatedAt"], 5);
    }

    #[test]
    fn foreign_versions_and_garbage_read_as_closed() {
        let mut open = CircuitRecord::closed(0);
        open.state = CircuitState::Open;
        open.version = 99;
        let raw = serde_json::to_string(&open).unwrap();
        assert_eq!(CircuitRecord::decode(&raw, 7), CircuitRecord::closed(7));
        assert_eq!(CircuitRecord::decode("{not json", 7), CircuitRecord::closed(7));
    }

    #[tokio::test]
    async fn opens_at_threshold_and_refuses_during_cooldown() {
        let clock = ManualClock::new(1_000);
        let (breaker, _) = persisted(3, &clock);

        for _ in 0..2 {
            breaker.report_failure(AuthAction::Login).await;
            assert!(breaker.check_circuit(AuthAction::Login).await.allowed);
        }
        breaker.report_failure(AuthAction::Login).await;

        let denied = breaker.check_circuit(AuthAction::Login).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(30_000));

        clock.advance(29_500);
        let denied = breaker.check_circuit(AuthAction::Login).await;
        assert_eq!(denied.retry_after_ms, Some(500));
        assert_eq!(denied.retry_after_secs(), Some(1));

        // Other actions are independent.
        assert!(breaker.check_circuit(AuthAction::Signup).await.allowed);
    }

    #[tokio::test]
    async fn one_probe_after_cooldown_then_close_on_success() {
        let clock = ManualClock::new(0);
        let (breaker, _) = persisted(1, &clock);
        breaker.report_failure(AuthAction::Logout).await;
        clock.advance(30_000);

        assert_eq!(breaker.snapshot(AuthAction::Logout).await.state, CircuitState::HalfOpen);
        let probe = breaker.check_circuit(AuthAction::Logout).await;
        assert!(probe.allowed && probe.probe);
        let second = breaker.check_circuit(AuthAction::Logout).await;
        assert!(!second.allowed);
        assert_eq!(second.retry_after_ms, Some(20_000));

        breaker.report_success(AuthAction::Logout).await;
        let snap = breaker.snapshot(AuthAction::Logout).await;
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(!snap.half_open_in_flight);
    }

    #[tokio::test]
    async fn failed_probe_reopens_with_fresh_cooldown() {
        let clock = ManualClock::new(0);
        let (breaker, _) = persisted(2, &clock);
        breaker.report_failure(AuthAction::Signup).await;
        breaker.report_failure(AuthAction::Signup).await;
        clock.advance(40_000);
        assert!(breaker.check_circuit(AuthAction::Signup).await.probe);

        breaker.report_failure(AuthAction::Signup).await;
        let snap = breaker.snapshot(AuthAction::Signup).await;
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.next_retry_at, Some(70_000));
        assert!(!snap.half_open_in_flight);
    }

    #[tokio::test]
    async fn failure_while_open_keeps_cooldown() {
        let clock = ManualClock::new(0);
        let (breaker, _) = persisted(1, &clock);
        breaker.report_failure(AuthAction::Login).await;
        clock.advance(10_000);
        breaker.report_failure(AuthAction::Login).await;
        let snap = breaker.snapshot(AuthAction::Login).await;
        assert_eq!(snap.next_retry_at, Some(30_000));
        assert_eq!(snap.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn abandoned_probe_is_reclaimed_after_lease() {
        let clock = ManualClock::new(0);
        let (breaker, _) = persisted(1, &clock);
        breaker.report_failure(AuthAction::PasswordReset).await;
        clock.advance(30_000);
        assert!(breaker.check_circuit(AuthAction::PasswordReset).await.probe);

        clock.advance(19_999);
        assert!(!breaker.check_circuit(AuthAction::PasswordReset).await.allowed);
        clock.advance(1);
        let reclaimed = breaker.check_circuit(AuthAction::PasswordReset).await;
        assert!(reclaimed.allowed && reclaimed.probe);
    }

    #[tokio::test]
    async fn losing_claim_race_backs_off() {
        let clock = ManualClock::new(0);
        let store = Arc::new(CompetingClaimStore {
            inner: InMemoryKvStore::with_clock(clock.clone()),
            armed: AtomicBool::new(false),
        });
        let sink = MemorySink::new();
        let breaker = CircuitBreaker::new(store.clone(), config(1))
            .with_clock(clock.clone())
            .with_sink(sink.clone());
        breaker.report_failure(AuthAction::Login).await;
        clock.advance(30_000);

        store.armed.store(true, Ordering::SeqCst);
        let decision = breaker.check_circuit(AuthAction::Login).await;
        assert!(!decision.allowed);
        assert!(sink
            .events()
            .contains(&ControlEvent::Circuit(CircuitEvent::ProbeRejected { action: AuthAction::Login })));
    }

    #[tokio::test]
    async fn store_outage_degrades_to_local_state() {
        let clock = ManualClock::new(0);
        let sink = MemorySink::new();
        let breaker = CircuitBreaker::new(Arc::new(DownStore), config(2))
            .with_clock(clock.clone())
            .with_sink(sink.clone());

        breaker.report_failure(AuthAction::Login).await;
        breaker.report_failure(AuthAction::Login).await;
        let decision = breaker.check_circuit(AuthAction::Login).await;
        assert!(!decision.allowed);

        let snap = breaker.snapshot(AuthAction::Login).await;
        assert!(snap.degraded);
        assert_eq!(snap.state, CircuitState::Open);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, ControlEvent::Circuit(CircuitEvent::Degraded { .. }))));
    }

    #[tokio::test]
    async fn stale_schema_in_store_starts_closed() {
        let clock = ManualClock::new(0);
        let (breaker, store) = persisted(1, &clock);
        let mut record = CircuitRecord::closed(0);
        record.version = 0;
        record.state = CircuitState::Open;
        record.next_retry_at = Some(u64::MAX);
        store
            .put(
                &circuit_key(AuthAction::Login),
                serde_json::to_string(&record).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(breaker.check_circuit(AuthAction::Login).await.allowed);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let clock = ManualClock::new(0);
        let breaker = CircuitBreaker::local(config(1)).with_clock(clock.clone());
        breaker.report_failure(AuthAction::Login).await;
        assert!(!breaker.check_circuit(AuthAction::Login).await.allowed);
        breaker.reset(AuthAction::Login).await;
        assert!(breaker.check_circuit(AuthAction::Login).await.allowed);
    }
}
