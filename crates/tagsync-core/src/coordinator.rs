//! One reconciliation pass.
//!
//! # Design
//!
//! A run has two phases. The inventory phase drains the lazy policy listing
//! page by page; if it fails, or shutdown is requested, the run ends before
//! any mutation. The convergence phase fans policies out over a bounded worker pool
//! (`JoinSet` + `Semaphore`); each worker looks up roles, resolves, plans and
//! applies on its own, and hands its outcome back to the coordinator task,
//! which is the only writer of the summary.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, TryStreamExt};
use tokio::sync::{Semaphore, watch};
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::enumerator::Enumerator;
use crate::error::DiscoveryError;
use crate::executor::MutationExecutor;
use crate::model::ManagedPolicy;
use crate::planner::{SyncMode, plan_with_mode};
use crate::resolver::resolve;
use crate::retry::RetryPolicy;
use crate::store::ResourceStore;
use crate::summary::{FailureKind, PairFailure, PairOutcome, RunSummary, SummaryBuilder};

/// Per-run tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Upper bound on policies processed at once.
    pub concurrency: usize,
    pub mode: SyncMode,
    /// Plan and log, but never write.
    pub dry_run: bool,
    /// Policy names to restrict the run to. Empty means all.
    pub targets: BTreeSet<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            mode: SyncMode::Authoritative,
            dry_run: false,
            targets: BTreeSet::new(),
        }
    }
}

/// Drives enumerate → resolve → plan → apply for every policy.
pub struct RunCoordinator {
    enumerator: Enumerator,
    executor: MutationExecutor,
    options: EngineOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RunCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, retry: RetryPolicy, options: EngineOptions) -> Self {
        let enumerator = Enumerator::new(Arc::clone(&store), retry.clone())
            .with_targets(options.targets.iter().cloned());
        let executor = MutationExecutor::new(store, retry);
        Self {
            enumerator,
            executor,
            options,
            shutdown: None,
        }
    }

    /// Stop scheduling new policies once `shutdown` turns true.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    #[must_use]
    pub const fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run one pass with a fresh run id.
    pub async fn run_once(&self) -> Result<RunSummary, DiscoveryError> {
        self.run_once_with_id(Uuid::new_v4()).await
    }

    /// Run one pass under a caller-chosen run id (e.g. the lease holder's).
    #[instrument(skip(self), fields(run_id = %run_id, mode = %self.options.mode, dry_run = self.options.dry_run))]
    pub async fn run_once_with_id(&self, run_id: Uuid) -> Result<RunSummary, DiscoveryError> {
        let mut builder = SummaryBuilder::start(run_id, self.options.dry_run);
        info!("Starting tag synchronization run");

        let mut cancelled = false;
        let mut inventory: Vec<ManagedPolicy> = Vec::new();
        let mut listing = std::pin::pin!(self.enumerator.policies());
        while let Some(policy) = listing.try_next().await? {
            inventory.push(policy);
            if self.shutdown_requested() {
                warn!("Shutdown requested during discovery; no policy will be changed");
                cancelled = true;
                inventory.clear();
                break;
            }
        }
        info!(policies = inventory.len(), "Discovered candidate policies");

        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut workers: JoinSet<(String, PairOutcome)> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, String> = HashMap::new();

        for policy in inventory {
            while let Some(joined) = workers.try_join_next_with_id() {
                record_joined(&mut builder, &mut in_flight, joined);
            }

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            if self.shutdown_requested() {
                warn!("Shutdown requested; not scheduling remaining policies");
                cancelled = true;
                break;
            }

            let enumerator = self.enumerator.clone();
            let executor = self.executor.clone();
            let mode = self.options.mode;
            let dry_run = self.options.dry_run;
            let policy_id = policy.id.clone();
            let handle = workers.spawn(async move {
                let _permit = permit;
                let policy_id = policy.id.clone();
                let outcome = AssertUnwindSafe(process_pair(
                    &enumerator,
                    &executor,
                    policy,
                    mode,
                    dry_run,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    PairOutcome::Failed(PairFailure {
                        policy_id: policy_id.clone(),
                        kind: FailureKind::Internal,
                        reason: "worker panicked".to_string(),
                    })
                });
                (policy_id, outcome)
            });
            in_flight.insert(handle.id(), policy_id);
        }

        while let Some(joined) = workers.join_next_with_id().await {
            record_joined(&mut builder, &mut in_flight, joined);
        }

        let summary = builder.finish(cancelled);
        info!(
            scanned = summary.policies_scanned(),
            mutated = summary.policies_mutated(),
            unchanged = summary.policies_unchanged(),
            failures = summary.failures().len(),
            cancelled = summary.cancelled(),
            summary = %serde_json::to_string(&summary).unwrap_or_default(),
            "Tag synchronization run finished"
        );
        Ok(summary)
    }
}

fn record_joined(
    builder: &mut SummaryBuilder,
    in_flight: &mut HashMap<task::Id, String>,
    joined: Result<(task::Id, (String, PairOutcome)), JoinError>,
) {
    match joined {
        Ok((id, (_, outcome))) => {
            in_flight.remove(&id);
            builder.record(outcome);
        }
        Err(err) => {
            let policy_id = in_flight.remove(&err.id()).unwrap_or_default();
            error!(policy_id = %policy_id, error = %err, "Policy worker did not complete");
            builder.record(PairOutcome::Failed(PairFailure {
                policy_id,
                kind: FailureKind::Internal,
                reason: format!("worker did not complete: {err}"),
            }));
        }
    }
}

#[instrument(skip_all, fields(policy_id = %policy.id))]
async fn process_pair(
    enumerator: &Enumerator,
    executor: &MutationExecutor,
    policy: ManagedPolicy,
    mode: SyncMode,
    dry_run: bool,
) -> PairOutcome {
    let roles = match enumerator.attached_roles(&policy).await {
        Ok(roles) => roles,
        Err(err) => {
            warn!(error = %err, "Skipping policy: attached roles unavailable");
            return PairOutcome::Failed(PairFailure::from_discovery(&policy.id, &err));
        }
    };

    let target = resolve(&roles);
    let plan = plan_with_mode(&policy, &target, mode);
    if plan.is_noop() {
        debug!(roles = roles.len(), "Policy already converged");
        return PairOutcome::Unchanged;
    }

    if dry_run {
        info!(
            to_set = ?plan.to_set(),
            to_remove = ?plan.to_remove(),
            "Dry run: policy would be updated"
        );
        return PairOutcome::Mutated;
    }

    match executor.apply(&plan).await {
        Ok(_) => PairOutcome::Mutated,
        Err(err) => {
            if err.is_permission() {
                error!(error = %err, "Permission denied; check the engine's role grants");
            } else {
                warn!(error = %err, "Policy mutation failed");
            }
            PairOutcome::Failed(PairFailure::from_mutation(&err))
        }
    }
}
