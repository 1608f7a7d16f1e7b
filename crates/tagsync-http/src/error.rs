//! HTTP store errors and status classification.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tagsync_core::{ConfigError, StoreError};
use thiserror::Error;

/// Longest response body excerpt carried in an error message.
const BODY_EXCERPT_CHARS: usize = 256;

/// Errors building an [`crate::HttpResourceStore`].
#[derive(Error, Debug)]
pub enum HttpStoreError {
    /// Store settings are unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Map a non-success response to a store error.
#[must_use]
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> StoreError {
    let detail = describe(status, body);
    match status.as_u16() {
        429 => StoreError::Throttled {
            retry_after: retry_after(headers),
        },
        408 | 425 | 500..=599 => StoreError::Transient(detail),
        401 | 403 => StoreError::PermissionDenied(detail),
        404 => StoreError::NotFound(detail),
        _ => StoreError::Rejected(detail),
    }
}

/// Map a failure to send or read a request.
#[must_use]
pub fn classify_transport(err: &reqwest::Error) -> StoreError {
    if err.is_builder() {
        return StoreError::Rejected(err.to_string());
    }
    if err.is_decode() {
        return StoreError::Rejected(format!("malformed response body: {err}"));
    }
    // Timeouts, refused connections and truncated bodies.
    StoreError::Transient(err.to_string())
}

/// Parse a `Retry-After` header given in whole seconds.
#[must_use]
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn describe(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().chars().take(BODY_EXCERPT_CHARS).collect());
    if message.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {message}")
    }
}
