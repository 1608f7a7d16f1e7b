//! Bounded retry with exponential backoff.
//!
//! Provides a small, deterministic policy for translating retry decisions into
//! concrete delays (including Retry-After hints), and a driver that runs a
//! store call under that policy.
//!
//! # Example
//!
//! ```ignore
//! use tagsync_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::new().with_jitter_enabled(false);
//! let page = with_retry(&policy, "list_policies", || store.list_policies(None)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// High-level retry decision for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry with exponential backoff (policy-controlled).
    Backoff,
    /// Retry after an explicit delay.
    After(Duration),
    /// Do not retry.
    Terminal,
}

impl RetryDecision {
    /// Returns true if this decision permits a retry.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Terminal)
    }
}

/// Policy for translating retry decisions into delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay for exponential backoff (milliseconds).
    pub base_backoff_ms: u64,
    /// Maximum delay for any single wait, hints included (milliseconds).
    pub max_backoff_ms: u64,
    /// Whether to add deterministic jitter to backoff delays.
    pub jitter_enabled: bool,
    /// Retries allowed after the first call. A call is made at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Offsets the jitter sequence so callers keyed differently spread out.
    pub jitter_seed: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 200,
            max_backoff_ms: 20_000,
            jitter_enabled: true,
            max_retries: 5,
            jitter_seed: 0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default().with_max_retries(0)
    }

    /// Builder: set base backoff delay.
    #[must_use]
    pub const fn with_base_backoff_ms(mut self, ms: u64) -> Self {
        self.base_backoff_ms = ms;
        self
    }

    /// Builder: set max backoff delay.
    #[must_use]
    pub const fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Builder: enable/disable jitter.
    #[must_use]
    pub const fn with_jitter_enabled(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Builder: set the retry ceiling.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Copy of this policy whose jitter is seeded from `key` (a policy id).
    #[must_use]
    pub fn keyed(&self, key: &str) -> Self {
        let seed = key.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
        Self {
            jitter_seed: seed,
            ..self.clone()
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn jitter_factor(&self, retry: u32) -> f64 {
        let offset = (self.jitter_seed % 1_000) as f64 / 1_000.0;
        f64::from(retry).mul_add(0.1, offset).fract()
    }

    /// Compute backoff delay for a given retry number (0-indexed).
    #[must_use]
    pub fn compute_backoff_ms(&self, retry: u32) -> u64 {
        let exp = retry.min(30);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exp);
        delay.min(self.max_backoff_ms)
    }

    /// Compute backoff delay with deterministic jitter.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute_backoff_with_jitter_ms(&self, retry: u32, jitter_factor: f64) -> u64 {
        let base = self.compute_backoff_ms(retry);
        if !self.jitter_enabled {
            return base;
        }

        let factor = jitter_factor.clamp(0.0, 1.0).mul_add(0.5, 0.5);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jittered = (base as f64 * factor) as u64;
        jittered
    }

    /// Translate a retry decision into a delay.
    ///
    /// Returns `None` when retry is not permitted (terminal or ceiling reached).
    #[must_use]
    pub fn next_delay(&self, retry: u32, decision: RetryDecision) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }

        match decision {
            RetryDecision::Terminal => None,
            RetryDecision::After(hint) => {
                Some(Duration::from_millis(duration_to_ms(hint).min(self.max_backoff_ms)))
            }
            RetryDecision::Backoff => {
                Some(Duration::from_millis(
                    self.compute_backoff_with_jitter_ms(retry, self.jitter_factor(retry)),
                ))
            }
        }
    }
}

/// Successful result of a retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    /// Calls made, including the successful one.
    pub attempts: u32,
}

/// Final failure of a retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub error: StoreError,
    /// Calls made before giving up.
    pub attempts: u32,
}

/// Run `call` until it succeeds, returns a terminal error, or the policy's
/// retry ceiling is reached.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<Retried<T>, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut retry = 0u32;
    loop {
        let attempts = retry + 1;
        match call().await {
            Ok(value) => return Ok(Retried { value, attempts }),
            Err(error) => {
                let Some(delay) = policy.next_delay(retry, error.retry_decision()) else {
                    return Err(RetryFailure { error, attempts });
                };
                tracing::debug!(
                    operation,
                    attempt = attempts,
                    delay_ms = duration_to_ms(delay),
                    error = %error,
                    "Retrying remote call"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
