//! Error taxonomy for discovery and mutation.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryDecision;

/// Failure reported by a remote resource store call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store asked us to slow down.
    #[error("throttled by remote store")]
    Throttled { retry_after: Option<Duration> },

    /// Timeout, connection failure or a 5xx-class error.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The engine's principal lacks a required permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The resource vanished between discovery and mutation.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The store refused the request as invalid.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The store does not implement this capability.
    #[error("operation not supported by store: {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    /// Classify this error for the retry loop.
    #[must_use]
    pub const fn retry_decision(&self) -> RetryDecision {
        match self {
            Self::Throttled {
                retry_after: Some(delay),
            } => RetryDecision::After(*delay),
            Self::Throttled { retry_after: None } | Self::Transient(_) => RetryDecision::Backoff,
            Self::PermissionDenied(_)
            | Self::NotFound(_)
            | Self::Rejected(_)
            | Self::Unsupported(_) => RetryDecision::Terminal,
        }
    }

    /// Returns true if a later attempt could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.retry_decision().is_retryable()
    }
}

/// Enumeration failed; the run cannot trust its inventory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// A policy listing page could not be fetched.
    #[error("listing policy page {page} failed after {attempts} attempt(s): {source}")]
    PageFetch {
        page: u32,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The store handed back a page token it had already returned.
    #[error("pagination token '{token}' repeated at page {page}")]
    RepeatedPageToken { token: String, page: u32 },

    /// Attached roles of one policy could not be listed.
    #[error("listing roles for policy {policy_id} failed after {attempts} attempt(s): {source}")]
    RoleLookup {
        policy_id: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// Which remote call of a mutation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    /// Combined set+remove call.
    Batched,
    /// Tag write.
    Set,
    /// Tag removal; the set phase, if any, already succeeded.
    Remove,
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batched => write!(f, "batched update"),
            Self::Set => write!(f, "tag"),
            Self::Remove => write!(f, "untag"),
        }
    }
}

/// Applying one policy's plan failed. Isolated to that policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// Configuration defect: the principal may not tag this policy. Never retried.
    #[error("{phase} on policy {policy_id} denied: {message}")]
    Permission {
        policy_id: String,
        phase: MutationPhase,
        message: String,
    },

    /// A retryable failure outlived the retry budget.
    #[error("{phase} on policy {policy_id} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        policy_id: String,
        phase: MutationPhase,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// A non-retryable failure other than a permission denial.
    #[error("{phase} on policy {policy_id} failed: {source}")]
    Permanent {
        policy_id: String,
        phase: MutationPhase,
        #[source]
        source: StoreError,
    },
}

impl MutationError {
    /// Build from the final store error of a retry loop.
    pub(crate) fn from_store(
        policy_id: &str,
        phase: MutationPhase,
        attempts: u32,
        source: StoreError,
    ) -> Self {
        let policy_id = policy_id.to_string();
        match source {
            StoreError::PermissionDenied(message) => Self::Permission {
                policy_id,
                phase,
                message,
            },
            source if source.is_retryable() => Self::Exhausted {
                policy_id,
                phase,
                attempts,
                source,
            },
            source => Self::Permanent {
                policy_id,
                phase,
                source,
            },
        }
    }

    #[must_use]
    pub fn policy_id(&self) -> &str {
        match self {
            Self::Permission { policy_id, .. }
            | Self::Exhausted { policy_id, .. }
            | Self::Permanent { policy_id, .. } => policy_id,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> MutationPhase {
        match self {
            Self::Permission { phase, .. }
            | Self::Exhausted { phase, .. }
            | Self::Permanent { phase, .. } => *phase,
        }
    }

    /// True for the permission-denied subtype.
    #[must_use]
    pub const fn is_permission(&self) -> bool {
        matches!(self, Self::Permission { .. })
    }
}
