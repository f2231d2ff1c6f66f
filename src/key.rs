//! Storage key construction.
//!
//! Subjects that identify a person (network address, email, bearer token) go through
//! [`hash_subject`] before they are embedded in a key, so neither the cache nor the logs
//! ever hold the raw value. The digest is deterministic: the same subject always maps to
//! the same counter.

use sha2::{Digest, Sha256};

use crate::action::AuthAction;

/// Prefix of every rate-limit record.
pub const RATE_LIMIT_PREFIX: &str = "rate_limit";
/// Prefix of every breaker record.
pub const CIRCUIT_PREFIX: &str = "auth:circuit";

/// `rate_limit:{namespace}:{subject}:{action}`.
///
/// ```
/// assert_eq!(quotaguard::key::rate_limit_key("feed", "anon", "read"), "rate_limit:feed:anon:read");
/// ```
pub fn rate_limit_key(namespace: &str, subject: &str, action: &str) -> String {
    format!("{RATE_LIMIT_PREFIX}:{namespace}:{subject}:{action}")
}

/// Lowercase hex SHA-256 of `raw`.
pub fn hash_subject(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// `auth:circuit:{action}`.
pub fn circuit_key(action: AuthAction) -> String {
    format!("{CIRCUIT_PREFIX}:{}", action.as_str())
}
