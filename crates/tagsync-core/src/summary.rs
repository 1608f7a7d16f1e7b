//! Run summary: the externally observable record of one pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DiscoveryError, MutationError, StoreError};

/// Why a policy could not be converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The principal lacks a permission; needs an operator.
    Permission,
    /// The policy disappeared mid-run.
    NotFound,
    /// Transient failures outlived the retry budget.
    Exhausted,
    /// The store refused the request.
    Rejected,
    /// Attached roles could not be listed.
    Discovery,
    /// The worker processing this policy panicked or was lost.
    Internal,
}

/// One policy that failed this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairFailure {
    pub policy_id: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl PairFailure {
    #[must_use]
    pub fn from_mutation(err: &MutationError) -> Self {
        let kind = match err {
            MutationError::Permission { .. } => FailureKind::Permission,
            MutationError::Exhausted { .. } => FailureKind::Exhausted,
            MutationError::Permanent { source, .. } => match source {
                StoreError::NotFound(_) => FailureKind::NotFound,
                StoreError::PermissionDenied(_) => FailureKind::Permission,
                _ => FailureKind::Rejected,
            },
        };
        Self {
            policy_id: err.policy_id().to_string(),
            kind,
            reason: err.to_string(),
        }
    }

    #[must_use]
    pub fn from_discovery(policy_id: &str, err: &DiscoveryError) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            kind: FailureKind::Discovery,
            reason: err.to_string(),
        }
    }
}

/// Immutable record of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    policies_scanned: u64,
    policies_mutated: u64,
    policies_unchanged: u64,
    failures: Vec<PairFailure>,
    dry_run: bool,
    cancelled: bool,
}

impl RunSummary {
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub const fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// Policies whose processing finished, successfully or not.
    #[must_use]
    pub const fn policies_scanned(&self) -> u64 {
        self.policies_scanned
    }

    /// Policies whose tags changed (or would change, in a dry run).
    #[must_use]
    pub const fn policies_mutated(&self) -> u64 {
        self.policies_mutated
    }

    #[must_use]
    pub const fn policies_unchanged(&self) -> u64 {
        self.policies_unchanged
    }

    /// Failures ordered by policy id.
    #[must_use]
    pub fn failures(&self) -> &[PairFailure] {
        &self.failures
    }

    #[must_use]
    pub const fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// True when the run stopped scheduling policies before the end.
    #[must_use]
    pub const fn cancelled(&self) -> bool {
        self.cancelled
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// What happened to one policy.
#[derive(Debug)]
pub(crate) enum PairOutcome {
    Unchanged,
    Mutated,
    Failed(PairFailure),
}

/// Single-writer accumulator owned by the coordinator task.
#[derive(Debug)]
pub(crate) struct SummaryBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    dry_run: bool,
    scanned: u64,
    mutated: u64,
    unchanged: u64,
    failures: Vec<PairFailure>,
}

impl SummaryBuilder {
    pub(crate) fn start(run_id: Uuid, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            dry_run,
            scanned: 0,
            mutated: 0,
            unchanged: 0,
            failures: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, outcome: PairOutcome) {
        self.scanned += 1;
        match outcome {
            PairOutcome::Unchanged => self.unchanged += 1,
            PairOutcome::Mutated => self.mutated += 1,
            PairOutcome::Failed(failure) => self.failures.push(failure),
        }
    }

    pub(crate) fn finish(mut self, cancelled: bool) -> RunSummary {
        self.failures
            .sort_by(|a, b| a.policy_id.cmp(&b.policy_id));
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            policies_scanned: self.scanned,
            policies_mutated: self.mutated,
            policies_unchanged: self.unchanged,
            failures: self.failures,
            dry_run: self.dry_run,
            cancelled,
        }
    }
}
