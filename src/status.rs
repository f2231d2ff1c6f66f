//! HTTP mapping of control-plane outcomes.
//!
//! | outcome | status | `retry-after` |
//! |---|---|---|
//! | malformed request | 400 | |
//! | quota exceeded | 429 | ceil seconds |
//! | limiter unavailable | 503 | ceil seconds |
//! | breaker open | 503 | ceil seconds |
//! | upstream 5xx / transport after retries | 502 | |
//! | upstream timeout | 504 | |
//! | upstream 4xx | upstream status | |

use std::fmt::Display;

use http::header::RETRY_AFTER;
use http::{HeaderValue, StatusCode};

use crate::error::GateError;
use crate::rate_limit::RateLimitDecision;

/// Status, `retry-after` and client-facing message for one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub retry_after: Option<HeaderValue>,
    pub message: String,
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

impl Response {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, retry_after: None, message: message.into() }
    }

    fn retry_in(mut self, retry_after_ms: u64) -> Self {
        self.retry_after = Some(HeaderValue::from(ceil_secs(retry_after_ms)));
        self
    }

    /// Response for a denied decision; `None` when the request was allowed.
    pub fn from_decision(decision: &RateLimitDecision) -> Option<Self> {
        if decision.allowed {
            return None;
        }
        let secs = ceil_secs(decision.retry_after_ms);
        let response = if decision.unavailable {
            Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Rate limiting is temporarily unavailable. Try again in {secs} seconds."),
            )
        } else {
            Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                format!("Too many requests. Try again in {secs} seconds."),
            )
        };
        Some(response.retry_in(decision.retry_after_ms))
    }

    pub fn from_error<E: Display>(err: &GateError<E>) -> Self {
        match err {
            GateError::BadRequest(reason) => Self::new(StatusCode::BAD_REQUEST, reason.clone()),
            GateError::RateLimited { retry_after_ms } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                format!("Too many requests. Try again in {} seconds.", ceil_secs(*retry_after_ms)),
            )
            .retry_in(*retry_after_ms),
            GateError::LimiterUnavailable { retry_after_ms } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!(
                    "Rate limiting is temporarily unavailable. Try again in {} seconds.",
                    ceil_secs(*retry_after_ms)
                ),
            )
            .retry_in(*retry_after_ms),
            GateError::CircuitOpen { retry_after_ms, .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!(
                    "Authentication is temporarily unavailable. Try again in {} seconds.",
                    ceil_secs(*retry_after_ms)
                ),
            )
            .retry_in(*retry_after_ms),
            GateError::UpstreamServer { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "Authentication provider error.")
            }
            GateError::UpstreamTimeout { .. } => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "Authentication provider timed out.")
            }
            GateError::Rejected { status, error } => Self::new(
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
                error.to_string(),
            ),
            GateError::Inner(error) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
            }
        }
    }

    /// Build an `http::Response` carrying the message as its body.
    pub fn to_http(&self) -> http::Response<String> {
        let mut response = http::Response::new(self.message.clone());
        *response.status_mut() = self.status;
        if let Some(value) = &self.retry_after {
            response.headers_mut().insert(RETRY_AFTER, value.clone());
        }
        response
    }
}

impl<E: Display> From<&GateError<E>> for Response {
    fn from(err: &GateError<E>) -> Self {
        Self::from_error(err)
    }
}
