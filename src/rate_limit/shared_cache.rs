//! Shared-Cache Fallback Counter: the fixed-window algorithm over a plain [`KvStore`].
//!
//! Read and write are independent calls, so two callers racing on the same key can both
//! read `count = limit - 1`, both admit, and both write `count = limit`. The over-admission
//! is bounded by the number of concurrently racing callers. This counter exists for
//! deployments without an actor tier and must never be preferred over one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{RateLimitConfig, RateLimitDecision, WindowCounter, WindowState};
use crate::error::{LimiterError, StoreError};
use crate::store::KvStore;

/// Best-effort window counter backed by a shared cache.
#[derive(Clone, Debug)]
pub struct SharedCacheCounter {
    store: Arc<dyn KvStore>,
}

impl SharedCacheCounter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Record expiry: the window length rounded up to whole seconds.
    pub fn record_ttl(config: &RateLimitConfig) -> Duration {
        Duration::from_secs(config.window_ms().div_ceil(1_000).max(1))
    }

    async fn load(&self, key: &str) -> Result<Option<WindowState>, StoreError> {
        match self.store.get(key).await? {
            Some(raw) => match serde_json::from_str::<WindowState>(&raw) {
                Ok(state) => Ok(Some(state)),
                Err(err) => {
                    // An unreadable record is treated like a miss and overwritten.
                    debug!(target: "quotaguard::shared_cache", key, error = %err, "discarding unreadable window record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WindowCounter for SharedCacheCounter {
    async fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Result<RateLimitDecision, LimiterError> {
        let previous = self.load(key).await?;
        let (next, decision) = WindowState::advance(previous, config, now);
        let encoded = serde_json::to_string(&next).map_err(StoreError::from)?;
        self.store.put(key, encoded, Self::record_ttl(config)).await?;
        Ok(decision)
    }
}
