//! Paginated discovery of candidate policies and their attached roles.
//!
//! Listings are lazy: pages are fetched only as the consumer pulls, so memory
//! stays bounded by one page regardless of inventory size. Every invocation
//! starts a fresh remote listing; streams cannot be resumed mid-page.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use futures_util::stream::{self, Stream, TryStreamExt};
use tracing::{debug, instrument, warn};

use crate::error::DiscoveryError;
use crate::model::{IdentityRole, ManagedPolicy};
use crate::retry::{RetryPolicy, with_retry};
use crate::store::ResourceStore;

/// A policy together with the roles currently attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBinding {
    pub policy: ManagedPolicy,
    pub roles: Vec<IdentityRole>,
}

/// Read-only discovery over a [`ResourceStore`].
#[derive(Clone)]
pub struct Enumerator {
    store: Arc<dyn ResourceStore>,
    retry: RetryPolicy,
    targets: Arc<BTreeSet<String>>,
}

struct Cursor {
    store: Arc<dyn ResourceStore>,
    retry: RetryPolicy,
    targets: Arc<BTreeSet<String>>,
    buffered: VecDeque<ManagedPolicy>,
    next_token: Option<String>,
    seen_tokens: HashSet<String>,
    page: u32,
    exhausted: bool,
}

impl Cursor {
    fn accepts(&self, policy: &ManagedPolicy) -> bool {
        if !policy.is_customer_managed() {
            debug!(policy_id = %policy.id, "Skipping provider-managed policy");
            return false;
        }
        self.targets.is_empty() || self.targets.contains(&policy.name)
    }

    async fn fetch_page(&mut self) -> Result<(), DiscoveryError> {
        let store = Arc::clone(&self.store);
        let token = self.next_token.take();
        let page = self.page;

        let fetched = with_retry(&self.retry, "list_policies", || {
            store.list_policies(token.as_deref())
        })
        .await
        .map_err(|failure| DiscoveryError::PageFetch {
            page,
            attempts: failure.attempts,
            source: failure.error,
        })?;

        let listing = fetched.value;
        debug!(
            page,
            policies = listing.policies.len(),
            has_more = listing.next_token.is_some(),
            "Fetched policy page"
        );

        self.page += 1;
        match listing.next_token {
            Some(next) if !self.seen_tokens.insert(next.clone()) => {
                return Err(DiscoveryError::RepeatedPageToken {
                    token: next,
                    page: self.page,
                });
            }
            Some(next) => self.next_token = Some(next),
            None => self.exhausted = true,
        }

        let accepted: Vec<ManagedPolicy> = listing
            .policies
            .into_iter()
            .filter(|policy| self.accepts(policy))
            .collect();
        self.buffered.extend(accepted);
        Ok(())
    }
}

impl Enumerator {
    /// Create an enumerator over every customer-managed policy.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            targets: Arc::new(BTreeSet::new()),
        }
    }

    /// Restrict discovery to policies with these names. Empty means all.
    #[must_use]
    pub fn with_targets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = Arc::new(names.into_iter().map(Into::into).collect());
        self
    }

    /// Lazily list candidate policies, following pagination to the end.
    ///
    /// The stream ends after yielding its first error.
    pub fn policies(
        &self,
    ) -> impl Stream<Item = Result<ManagedPolicy, DiscoveryError>> + Send + 'static {
        let cursor = Cursor {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
            targets: Arc::clone(&self.targets),
            buffered: VecDeque::new(),
            next_token: None,
            seen_tokens: HashSet::new(),
            page: 0,
            exhausted: false,
        };

        stream::unfold(Some(cursor), |state| async move {
            let Some(mut cursor) = state else {
                return None;
            };
            loop {
                if let Some(policy) = cursor.buffered.pop_front() {
                    return Some((Ok(policy), Some(cursor)));
                }
                if cursor.exhausted {
                    return None;
                }
                if let Err(err) = cursor.fetch_page().await {
                    warn!(error = %err, "Policy discovery failed");
                    return Some((Err(err), None));
                }
            }
        })
    }

    /// List the roles attached to one policy.
    #[instrument(skip(self, policy), fields(policy_id = %policy.id))]
    pub async fn attached_roles(
        &self,
        policy: &ManagedPolicy,
    ) -> Result<Vec<IdentityRole>, DiscoveryError> {
        let store = &self.store;
        let policy_id = policy.id.as_str();
        let retry = self.retry.keyed(policy_id);
        let fetched = with_retry(&retry, "list_attached_roles", || {
            store.list_attached_roles(policy_id)
        })
        .await
        .map_err(|failure| DiscoveryError::RoleLookup {
            policy_id: policy.id.clone(),
            attempts: failure.attempts,
            source: failure.error,
        })?;
        debug!(roles = fetched.value.len(), "Listed attached roles");
        Ok(fetched.value)
    }

    /// Lazily yield every candidate policy with its attached roles.
    pub fn enumerate(
        &self,
    ) -> impl Stream<Item = Result<PolicyBinding, DiscoveryError>> + Send + 'static {
        let this = self.clone();
        self.policies().and_then(move |policy| {
            let this = this.clone();
            async move {
                let roles = this.attached_roles(&policy).await?;
                Ok::<_, DiscoveryError>(PolicyBinding { policy, roles })
            }
        })
    }
}
