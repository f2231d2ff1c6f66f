//! Upstream call executor for identity-provider actions.
//!
//! One [`execute`](UpstreamExecutor::execute) call:
//! 1. asks the [`CircuitBreaker`] for admission; a refusal never reaches upstream,
//! 2. runs the call with the action's per-attempt timeout,
//! 3. retries server errors, transport errors and timeouts up to the action's retry count
//!    with a fixed delay,
//! 4. reports the final outcome to the breaker.
//!
//! A client error (4xx) is a definitive answer about the request, not about upstream
//! health: it is not retried, counts as a *successful* call for the breaker, and is
//! surfaced as [`GateError::Rejected`].
//!
//! The whole sequence runs on a spawned task. If the inbound request is dropped mid-call,
//! the upstream call still finishes and the breaker still hears about it, so a half-open
//! probe is never abandoned by a disconnecting client. A panic inside the upstream call
//! counts as a transient failure.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::action::AuthAction;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{AuthPolicies, DynamicConfig};
use crate::error::{ConfigError, GateError};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{emit, ControlEvent, NullSink, TelemetrySink, UpstreamEvent};

/// How one upstream attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure<E> {
    /// Upstream refused the request (4xx). Final.
    Client { status: u16, error: E },
    /// Upstream failed to serve the request (5xx). Retried.
    Server { status: u16, error: E },
    /// No response at all (connection reset, DNS, TLS). Retried.
    Transport(E),
}

impl<E> UpstreamFailure<E> {
    /// Classify by HTTP status: 5xx is a server failure, anything else a client failure.
    pub fn from_status(status: u16, error: E) -> Self {
        if status >= 500 {
            UpstreamFailure::Server { status, error }
        } else {
            UpstreamFailure::Client { status, error }
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, UpstreamFailure::Client { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamFailure::Client { status, .. } | UpstreamFailure::Server { status, .. } => {
                Some(*status)
            }
            UpstreamFailure::Transport(_) => None,
        }
    }
}

// Last transient failure seen, kept to build the final error.
#[derive(Debug, Clone, Copy)]
enum Transient {
    Server(Option<u16>),
    Timeout(Duration),
}

/// Breaker-guarded, retrying caller of the identity provider.
#[derive(Clone, Debug)]
pub struct UpstreamExecutor<S = NullSink> {
    breaker: CircuitBreaker<S>,
    policies: DynamicConfig<AuthPolicies>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S: TelemetrySink> UpstreamExecutor<S> {
    pub fn new(breaker: CircuitBreaker<S>, policies: DynamicConfig<AuthPolicies>) -> Self {
        Self { breaker, policies, sleeper: Arc::new(TokioSleeper) }
    }

    /// Replace the sleeper used between retries.
    pub fn with_sleeper<Z: Sleeper + 'static>(mut self, sleeper: Z) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker<S> {
        &self.breaker
    }

    pub fn policies(&self) -> &DynamicConfig<AuthPolicies> {
        &self.policies
    }

    /// Replace the policy table, refusing one whose calls can outlive the breaker's probe
    /// lease.
    pub fn set_policies(&self, table: AuthPolicies) -> Result<(), ConfigError> {
        table.check_probe_lease(self.breaker.config().probe_lease())?;
        self.policies.set(table);
        Ok(())
    }

    /// Run `op` for `action` under the breaker with retries and per-attempt timeouts.
    ///
    /// `op` is invoked once per attempt.
    pub async fn execute<T, E, F, Fut>(&self, action: AuthAction, op: F) -> Result<T, GateError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UpstreamFailure<E>>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let admission = self.breaker.check_circuit(action).await;
        if !admission.allowed {
            let retry_after_ms = admission
                .retry_after_ms
                .unwrap_or_else(|| self.breaker.config().cooldown().as_millis() as u64);
            return Err(GateError::CircuitOpen { action, retry_after_ms });
        }

        let this = self.clone();
        match tokio::spawn(async move { this.run(action, op).await }).await {
            Ok(result) => result,
            Err(err) => {
                warn!(target: "quotaguard::executor", %action, error = %err, "upstream task did not complete");
                // The task died before its own accounting; release a claimed probe here.
                self.breaker.report_failure(action).await;
                Err(GateError::UpstreamServer { action, attempts: 0, status: None })
            }
        }
    }

    async fn run<T, E, F, Fut>(&self, action: AuthAction, mut op: F) -> Result<T, GateError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UpstreamFailure<E>>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let policy = *self.policies.get().get(action);
        let max_attempts = policy.max_attempts();
        let mut attempt = 0;

        let last = loop {
            attempt += 1;
            let transient = match self.attempt(&mut op, policy.timeout()).await {
                Ok(Ok(value)) => {
                    self.breaker.report_success(action).await;
                    return Ok(value);
                }
                Ok(Err(UpstreamFailure::Client { status, error })) => {
                    debug!(target: "quotaguard::executor", %action, status, "upstream rejected request");
                    self.breaker.report_success(action).await;
                    self.emit(UpstreamEvent::Rejected { action, status }).await;
                    return Err(GateError::Rejected { status, error });
                }
                Ok(Err(UpstreamFailure::Server { status, .. })) => Transient::Server(Some(status)),
                Ok(Err(UpstreamFailure::Transport(_))) => Transient::Server(None),
                Err(transient) => transient,
            };

            if let Transient::Timeout(timeout) = transient {
                self.emit(UpstreamEvent::TimedOut { action, attempt, timeout }).await;
            }
            if attempt >= max_attempts {
                break transient;
            }

            let delay = policy.retry_delay();
            debug!(target: "quotaguard::executor", %action, attempt, ?delay, "retrying upstream call");
            self.emit(UpstreamEvent::Retry { action, attempt, delay }).await;
            self.sleeper.sleep(delay).await;
        };

        warn!(target: "quotaguard::executor", %action, attempts = attempt, "upstream call failed");
        self.breaker.report_failure(action).await;
        self.emit(UpstreamEvent::Exhausted { action, attempts: attempt }).await;

        Err(match last {
            Transient::Server(status) => GateError::UpstreamServer { action, attempts: attempt, status },
            Transient::Timeout(timeout) => {
                GateError::UpstreamTimeout { action, attempts: attempt, timeout }
            }
        })
    }

    // One attempt on its own task, so a panic surfaces as a join error and a timeout can
    // abort it.
    async fn attempt<T, E, F, Fut>(
        &self,
        op: &mut F,
        timeout: Duration,
    ) -> Result<Result<T, UpstreamFailure<E>>, Transient>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UpstreamFailure<E>>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let Ok(fut) = catch_unwind(AssertUnwindSafe(op)) else {
            warn!(target: "quotaguard::executor", "upstream call panicked before starting");
            return Err(Transient::Server(None));
        };

        let mut handle = tokio::spawn(fut);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                warn!(target: "quotaguard::executor", error = %err, "upstream call panicked");
                Err(Transient::Server(None))
            }
            Err(_) => {
                handle.abort();
                Err(Transient::Timeout(timeout))
            }
        }
    }

    async fn emit(&self, event: UpstreamEvent) {
        emit(self.breaker.sink(), ControlEvent::Upstream(event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::config::{ActionPolicy, BreakerConfig};
    use crate::rate_limit::RateLimitConfig;
    use crate::sleeper::RecordingSleeper;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policies(action: AuthAction, retries: u32, timeout: Duration) -> DynamicConfig<AuthPolicies> {
        let policy = ActionPolicy::new(
            RateLimitConfig::per_minute(10).unwrap(),
            retries,
            Duration::from_millis(250),
            timeout,
        )
        .unwrap();
        DynamicConfig::new(AuthPolicies::default().with(action, policy))
    }

    fn breaker(threshold: u32) -> CircuitBreaker<MemorySink> {
        let config = BreakerConfig::new(
            threshold,
            Duration::from_secs(30),
            Duration::from_secs(600),
            Duration::from_secs(20),
        )
        .unwrap();
        CircuitBreaker::local(config).with_sink(MemorySink::new())
    }

    #[tokio::test]
    async fn retries_server_errors_with_fixed_delay() {
        let sleeper = RecordingSleeper::new();
        let exec = UpstreamExecutor::new(
            breaker(5),
            policies(AuthAction::PasswordReset, 1, Duration::from_secs(5)),
        )
        .with_sleeper(sleeper.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = exec
            .execute(AuthAction::PasswordReset, move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(UpstreamFailure::Server { status: 503, error: "busy" })
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(250)]);
        let snap = exec.breaker().snapshot(AuthAction::PasswordReset).await;
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn client_errors_are_final_and_do_not_count() {
        let exec = UpstreamExecutor::new(
            breaker(1),
            policies(AuthAction::Logout, 3, Duration::from_secs(5)),
        )
        .with_sleeper(RecordingSleeper::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = exec
            .execute(AuthAction::Logout, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(UpstreamFailure::from_status(401, "bad token")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GateError::Rejected { status: 401, error: "bad token" }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.breaker().snapshot(AuthAction::Logout).await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn exhausted_retries_open_the_breaker() {
        let sink_breaker = breaker(1);
        let sink = sink_breaker.sink().clone();
        let exec = UpstreamExecutor::new(
            sink_breaker,
            policies(AuthAction::Login, 0, Duration::from_secs(5)),
        );

        let err = exec
            .execute(AuthAction::Login, || async {
                Err::<(), _>(UpstreamFailure::Transport("connection reset"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UpstreamServer { attempts: 1, status: None, .. }));

        let refused = exec
            .execute(AuthAction::Login, || async { Ok::<_, UpstreamFailure<&str>>(()) })
            .await
            .unwrap_err();
        assert!(refused.is_circuit_open());
        assert!(sink
            .events()
            .contains(&ControlEvent::Upstream(UpstreamEvent::Exhausted {
                action: AuthAction::Login,
                attempts: 1
            })));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_surface_as_upstream_timeout() {
        let exec = UpstreamExecutor::new(
            breaker(5),
            policies(AuthAction::Signup, 0, Duration::from_millis(100)),
        );
        let err = exec
            .execute(AuthAction::Signup, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, UpstreamFailure<()>>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::UpstreamTimeout { attempts: 1, timeout, .. } if timeout == Duration::from_millis(100)
        ));
    }

    #[tokio::test]
    async fn panics_count_as_transient_failures() {
        let exec = UpstreamExecutor::new(
            breaker(5),
            policies(AuthAction::Logout, 1, Duration::from_secs(5)),
        )
        .with_sleeper(RecordingSleeper::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = exec
            .execute(AuthAction::Logout, move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("upstream client bug");
                    }
                    Ok::<_, UpstreamFailure<()>>(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_still_reports_outcome() {
        let exec = UpstreamExecutor::new(
            breaker(1),
            policies(AuthAction::Login, 0, Duration::from_secs(5)),
        );
        let call = exec.execute(AuthAction::Login, || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err::<(), _>(UpstreamFailure::Server { status: 500, error: () })
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snap = exec.breaker().snapshot(AuthAction::Login).await;
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(snap.state, CircuitState::Open);
    }

    #[derive(Debug)]
    struct BrokenTimer;

    impl Sleeper for BrokenTimer {
        fn sleep(&self, _duration: Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async { panic!("timer driver gone") })
        }
    }

    #[tokio::test]
    async fn failed_task_still_releases_the_breaker() {
        let exec = UpstreamExecutor::new(
            breaker(1),
            policies(AuthAction::Logout, 1, Duration::from_secs(5)),
        )
        .with_sleeper(BrokenTimer);

        // The first attempt fails transiently; the retry delay then kills the task.
        let err = exec
            .execute(AuthAction::Logout, || async {
                Err::<(), _>(UpstreamFailure::Transport("reset"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UpstreamServer { attempts: 0, .. }));

        let snap = exec.breaker().snapshot(AuthAction::Logout).await;
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.consecutive_failures, 1);
    }

    #[test]
    fn policy_updates_must_fit_the_probe_lease() {
        let exec = UpstreamExecutor::new(breaker(1), DynamicConfig::new(AuthPolicies::default()));
        let slow = ActionPolicy::new(
            RateLimitConfig::per_minute(30).unwrap(),
            3,
            Duration::from_millis(250),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = exec.set_policies(AuthPolicies::default().with(AuthAction::Logout, slow));
        assert!(matches!(err, Err(ConfigError::ProbeOutlivesLease { action: AuthAction::Logout, .. })));
        assert_eq!(*exec.policies().get(), AuthPolicies::default());

        let quick = ActionPolicy::new(
            RateLimitConfig::per_minute(30).unwrap(),
            2,
            Duration::from_millis(250),
            Duration::from_secs(5),
        )
        .unwrap();
        exec.set_policies(AuthPolicies::default().with(AuthAction::Logout, quick)).unwrap();
        assert_eq!(exec.policies().get().get(AuthAction::Logout).retries(), 2);
    }
}
