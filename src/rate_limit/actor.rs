//! Window Counter Actor: strongly consistent, single-owner counting per key.
//!
//! Every key gets its own tokio task holding that key's [`WindowState`]. Checks for the key
//! are sent over the task's mailbox and handled one at a time, so there is a total order of
//! increments: two concurrent callers can never both see `count - 1` and both be admitted
//! for the last slot.
//!
//! Actors are spawned lazily on first use. An actor that has been idle for at least the
//! longest window it has seen closes its mailbox, answers whatever was already queued, and
//! exits; its state could only ever have been stale by then. The next check for the key
//! spawns a fresh actor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::{RateLimitConfig, RateLimitDecision, WindowCounter, WindowState};
use crate::error::LimiterError;

/// Default mailbox depth per key.
pub const DEFAULT_MAILBOX: usize = 64;
/// Default floor for the idle period before an actor exits.
pub const DEFAULT_IDLE: Duration = Duration::from_secs(60);
/// Registry size at which retired actors' entries are swept.
const PRUNE_EVERY: usize = 1024;

type Reply = oneshot::Sender<Result<RateLimitDecision, LimiterError>>;

enum CounterMessage {
    Check { limit: u32, window_ms: u64, now: u64, reply: Reply },
}

/// Handle to the per-key actor tier. Clones address the same actors.
#[derive(Clone, Debug)]
pub struct ActorCounter {
    actors: Arc<Mutex<HashMap<String, mpsc::Sender<CounterMessage>>>>,
    mailbox: usize,
    min_idle: Duration,
}

impl Default for ActorCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorCounter {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_MAILBOX, DEFAULT_IDLE)
    }

    /// `mailbox` is clamped to at least 1. Actors idle for
    /// `max(min_idle, largest window seen)` before exiting.
    pub fn with_settings(mailbox: usize, min_idle: Duration) -> Self {
        Self {
            actors: Arc::new(Mutex::new(HashMap::new())),
            mailbox: mailbox.max(1),
            min_idle,
        }
    }

    /// Actors currently accepting messages.
    pub fn live_actors(&self) -> usize {
        match self.actors.lock() {
            Ok(guard) => guard.values().filter(|tx| !tx.is_closed()).count(),
            Err(_) => 0,
        }
    }

    /// Check with raw quota values; a zero `limit` or `window_ms` is refused by the actor
    /// as a client error.
    pub async fn check_raw(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
        now: u64,
    ) -> Result<RateLimitDecision, LimiterError> {
        let (reply, response) = oneshot::channel();
        let mut message = CounterMessage::Check { limit, window_ms, now, reply };

        // A send can only fail if the actor exited between lookup and send; respawn once.
        for _ in 0..2 {
            let tx = self.sender_for(key, None)?;
            match tx.send(message).await {
                Ok(()) => {
                    return response.await.map_err(|_| {
                        LimiterError::Unavailable(format!("actor for {key} dropped the reply"))
                    })?;
                }
                Err(mpsc::error::SendError(returned)) => {
                    trace!(target: "quotaguard::actor", key, "actor retired; respawning");
                    message = returned;
                    self.sender_for(key, Some(&tx))?;
                }
            }
        }
        Err(LimiterError::Unavailable(format!("actor for {key} is not accepting messages")))
    }

    /// Look up the live sender for `key`, spawning an actor if there is none. When `stale`
    /// is given and still registered, it is replaced.
    fn sender_for(
        &self,
        key: &str,
        stale: Option<&mpsc::Sender<CounterMessage>>,
    ) -> Result<mpsc::Sender<CounterMessage>, LimiterError> {
        let mut actors = self
            .actors
            .lock()
            .map_err(|_| LimiterError::Unavailable("actor registry poisoned".into()))?;
        if let Some(existing) = actors.get(key) {
            let is_stale = stale.map_or(false, |s| s.same_channel(existing));
            if !is_stale && !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        if actors.len() % PRUNE_EVERY == PRUNE_EVERY - 1 {
            actors.retain(|_, tx| !tx.is_closed());
        }
        let (tx, rx) = mpsc::channel(self.mailbox);
        tokio::spawn(run_actor(key.to_string(), rx, self.min_idle));
        actors.insert(key.to_string(), tx.clone());
        debug!(target: "quotaguard::actor", key, "spawned window counter actor");
        Ok(tx)
    }
}

#[async_trait]
impl WindowCounter for ActorCounter {
    async fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Result<RateLimitDecision, LimiterError> {
        self.check_raw(key, config.limit(), config.window_ms(), now).await
    }
}

async fn run_actor(key: String, mut rx: mpsc::Receiver<CounterMessage>, min_idle: Duration) {
    let mut state: Option<WindowState> = None;
    let mut idle = min_idle;

    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(message)) => {
                if let Some(window) = handle(&mut state, message) {
                    idle = idle.max(window);
                }
            }
            Ok(None) => break,
            Err(_) => {
                rx.close();
                while let Ok(message) = rx.try_recv() {
                    handle(&mut state, message);
                }
                break;
            }
        }
    }

    debug!(target: "quotaguard::actor", key = %key, "window counter actor exiting");
}

/// Returns the window length of a valid request.
fn handle(state: &mut Option<WindowState>, message: CounterMessage) -> Option<Duration> {
    match message {
        CounterMessage::Check { limit, window_ms, now, reply } => {
            match RateLimitConfig::from_millis(limit, window_ms) {
                Ok(config) => {
                    let (next, decision) = WindowState::advance(*state, &config, now);
                    *state = Some(next);
                    // The caller may have given up waiting; the count still stands.
                    let _ = reply.send(Ok(decision));
                    Some(config.window())
                }
                Err(err) => {
                    let _ = reply.send(Err(LimiterError::InvalidConfig(err)));
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use futures::future::join_all;

    #[tokio::test]
    async fn first_check_opens_window_and_later_ones_count() {
        let counter = ActorCounter::new();
        let config = RateLimitConfig::from_millis(2, 10_000).unwrap();

        let d1 = counter.check("k", &config, 1_000).await.unwrap();
        let d2 = counter.check("k", &config, 1_000).await.unwrap();
        let d3 = counter.check("k", &config, 1_000).await.unwrap();

        assert!(d1.allowed);
        assert!(d2.allowed);
        assert!(!d3.allowed);
        assert_eq!(d3.retry_after_ms, 9_000);
        assert_eq!(d3.window_start, 0);
        assert_eq!(counter.live_actors(), 1);
    }

    #[tokio::test]
    async fn rejects_non_positive_quota_as_client_error() {
        let counter = ActorCounter::new();
        let err = counter.check_raw("k", 0, 1_000, 0).await.unwrap_err();
        assert!(matches!(err, LimiterError::InvalidConfig(ConfigError::InvalidLimit(0))));
        let err = counter.check_raw("k", 1, 0, 0).await.unwrap_err();
        assert!(matches!(err, LimiterError::InvalidConfig(ConfigError::InvalidWindow(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_limit() {
        let counter = ActorCounter::new();
        let config = RateLimitConfig::from_millis(7, 60_000).unwrap();

        let checks = (0..50).map(|_| {
            let counter = counter.clone();
            tokio::spawn(async move { counter.check("hot", &config, 5_000).await })
        });
        let allowed = join_all(checks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|d| d.allowed)
            .count();

        assert_eq!(allowed, 7);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let counter = ActorCounter::new();
        let config = RateLimitConfig::from_millis(1, 60_000).unwrap();
        assert!(counter.check("a", &config, 0).await.unwrap().allowed);
        assert!(counter.check("b", &config, 0).await.unwrap().allowed);
        assert!(!counter.check("a", &config, 0).await.unwrap().allowed);
        assert_eq!(counter.live_actors(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_actor_retires_and_is_respawned() {
        let counter = ActorCounter::with_settings(8, Duration::from_secs(1));
        let config = RateLimitConfig::from_millis(1, 500).unwrap();

        assert!(counter.check("k", &config, 0).await.unwrap().allowed);
        assert_eq!(counter.live_actors(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.live_actors(), 0);

        // A later window: a fresh actor starts a fresh count.
        let decision = counter.check("k", &config, 2_000).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.window_start, 2_000);
        assert_eq!(counter.live_actors(), 1);
    }
}
