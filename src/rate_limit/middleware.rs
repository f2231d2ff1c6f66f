use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use crate::error::GateError;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::telemetry::{NullSink, TelemetrySink};

type KeyFn<Req> = dyn Fn(&Req) -> Option<String> + Send + Sync;

/// A layer that gates every request through a [`RateLimiter`].
///
/// The key extractor runs before any quota is spent; returning `None` rejects the request
/// with [`GateError::BadRequest`].
pub struct RateLimitLayer<Req, S = NullSink> {
    limiter: RateLimiter<S>,
    config: RateLimitConfig,
    key: Arc<KeyFn<Req>>,
}

impl<Req, S: TelemetrySink> RateLimitLayer<Req, S> {
    pub fn new<F>(limiter: RateLimiter<S>, config: RateLimitConfig, key: F) -> Self
    where
        F: Fn(&Req) -> Option<String> + Send + Sync + 'static,
    {
        Self { limiter, config, key: Arc::new(key) }
    }
}

impl<Req, S: Clone> Clone for RateLimitLayer<Req, S> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), config: self.config, key: self.key.clone() }
    }
}

impl<Req, S: fmt::Debug> fmt::Debug for RateLimitLayer<Req, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("limiter", &self.limiter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Inner, Req, S> Layer<Inner> for RateLimitLayer<Req, S>
where
    S: TelemetrySink,
{
    type Service = RateLimitService<Inner, Req, S>;

    fn layer(&self, service: Inner) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            config: self.config,
            key: self.key.clone(),
        }
    }
}

/// Middleware service that enforces a fixed-window quota per extracted key.
pub struct RateLimitService<Inner, Req, S = NullSink> {
    inner: Inner,
    limiter: RateLimiter<S>,
    config: RateLimitConfig,
    key: Arc<KeyFn<Req>>,
}

impl<Inner: Clone, Req, S: Clone> Clone for RateLimitService<Inner, Req, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            config: self.config,
            key: self.key.clone(),
        }
    }
}

impl<Inner: fmt::Debug, Req, S: fmt::Debug> fmt::Debug for RateLimitService<Inner, Req, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Inner, Req, S> Service<Req> for RateLimitService<Inner, Req, S>
where
    Inner: Service<Req> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Send + 'static,
    Req: Send + 'static,
    S: TelemetrySink,
{
    type Response = Inner::Response;
    type Error = GateError<Inner::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let config = self.config;
        let key = (self.key)(&req);
        // The clone may not be ready; swap so the driven instance is the one we call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let Some(key) = key else {
                return Err(GateError::BadRequest("missing rate limit key".into()));
            };
            let decision = limiter.check_now(&key, &config).await;
            if decision.allowed {
                inner.call(req).await.map_err(GateError::Inner)
            } else if decision.unavailable {
                Err(GateError::LimiterUnavailable { retry_after_ms: decision.retry_after_ms })
            } else {
                Err(GateError::RateLimited { retry_after_ms: decision.retry_after_ms })
            }
        })
    }
}
