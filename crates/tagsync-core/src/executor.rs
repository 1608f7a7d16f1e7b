//! Applies mutation plans against the remote store.
//!
//! Batched stores get one combined call. Otherwise tags are set first and
//! removed second; removal never precedes the write, so a required key is
//! never briefly absent. A failed removal after a successful write fails the
//! whole policy, leaving the removal for the next run's plan.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{MutationError, MutationPhase};
use crate::model::TagMutationPlan;
use crate::retry::{RetryPolicy, with_retry};
use crate::store::ResourceStore;

/// Which remote calls an applied plan issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedVia {
    /// Nothing to do; no remote call.
    Noop,
    /// One combined set+remove call.
    Batched,
    /// Separate set and/or remove calls.
    Sequential { set: bool, remove: bool },
}

/// A plan that reached the store successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Applied {
    pub policy_id: String,
    pub via: AppliedVia,
    /// Remote calls made, retries included.
    pub attempts: u32,
}

/// Side-effecting half of the engine.
#[derive(Clone)]
pub struct MutationExecutor {
    store: Arc<dyn ResourceStore>,
    retry: RetryPolicy,
}

impl MutationExecutor {
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Apply `plan`, retrying transient failures within the retry policy.
    #[instrument(skip(self, plan), fields(policy_id = %plan.policy_id()))]
    pub async fn apply(&self, plan: &TagMutationPlan) -> Result<Applied, MutationError> {
        let policy_id = plan.policy_id();
        if plan.is_noop() {
            debug!("Plan is empty; skipping remote call");
            return Ok(Applied {
                policy_id: policy_id.to_string(),
                via: AppliedVia::Noop,
                attempts: 0,
            });
        }

        let store = &self.store;
        let retry = self.retry.keyed(policy_id);
        let to_set = plan.to_set();
        let to_remove = plan.to_remove();

        if store.supports_batched_update() {
            let done = with_retry(&retry, "update_policy_tags", || {
                store.update_policy_tags(policy_id, to_set, to_remove)
            })
            .await
            .map_err(|failure| {
                MutationError::from_store(
                    policy_id,
                    MutationPhase::Batched,
                    failure.attempts,
                    failure.error,
                )
            })?;
            info!(
                set = to_set.len(),
                removed = to_remove.len(),
                attempts = done.attempts,
                "Applied tag update"
            );
            return Ok(Applied {
                policy_id: policy_id.to_string(),
                via: AppliedVia::Batched,
                attempts: done.attempts,
            });
        }

        let mut attempts = 0;
        if !to_set.is_empty() {
            let done = with_retry(&retry, "tag_policy", || {
                store.tag_policy(policy_id, to_set)
            })
            .await
            .map_err(|failure| {
                MutationError::from_store(
                    policy_id,
                    MutationPhase::Set,
                    failure.attempts,
                    failure.error,
                )
            })?;
            attempts += done.attempts;
        }

        if !to_remove.is_empty() {
            let done = with_retry(&retry, "untag_policy", || {
                store.untag_policy(policy_id, to_remove)
            })
            .await
            .map_err(|failure| {
                if !to_set.is_empty() {
                    warn!(
                        set = to_set.len(),
                        pending_removals = to_remove.len(),
                        "Tags written but removal failed"
                    );
                }
                MutationError::from_store(
                    policy_id,
                    MutationPhase::Remove,
                    failure.attempts,
                    failure.error,
                )
            })?;
            attempts += done.attempts;
        }

        info!(
            set = to_set.len(),
            removed = to_remove.len(),
            attempts,
            "Applied tag mutations"
        );
        Ok(Applied {
            policy_id: policy_id.to_string(),
            via: AppliedVia::Sequential {
                set: !to_set.is_empty(),
                remove: !to_remove.is_empty(),
            },
            attempts,
        })
    }
}
