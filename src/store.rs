//! Shared key-value cache abstraction.
//!
//! Rate-limit records (`rate_limit:*`) and breaker records (`auth:circuit:*`) live in a
//! cache shared by every worker. The interface is deliberately the weakest one such caches
//! offer: independent `get` and `put`, each `put` carrying a time-to-live. There is no
//! delete and no compare-and-set; staleness is handled entirely by TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Eventually-consistent key-value cache with per-entry expiry.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Fetch the value under `key`, or `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite the value under `key`; it expires after `ttl`.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;
}

/// Process-local [`KvStore`] with TTL expiry, for tests and single-process deployments.
/// Clones share the same map.
#[derive(Clone, Debug)]
pub struct InMemoryKvStore {
    // key -> (value, expires_at_millis)
    data: Arc<Mutex<HashMap<String, (String, u64)>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Use `clock` to judge expiry (pair with a `ManualClock` in tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { data: Arc::new(Mutex::new(HashMap::new())), clock: Arc::new(clock) }
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        match self.data.lock() {
            Ok(guard) => guard.values().filter(|(_, expires_at)| *expires_at > now).count(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, (String, u64)>>, StoreError> {
        self.data.lock().map_err(|_| StoreError::Unavailable("in-memory store poisoned".into()))
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock()?;
        match guard.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = self.clock.now_millis().saturating_add(ttl_ms);
        let mut guard = self.lock()?;
        guard.insert(key.to_string(), (value, expires_at));
        Ok(())
    }
}
