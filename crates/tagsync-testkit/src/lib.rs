//! Testing support for tagsync.
//!
//! [`MemoryStore`] is an in-memory [`ResourceStore`] with pagination, call
//! recording and fault injection, so engine behavior can be exercised
//! without a network.
//!
//! ```ignore
//! let store = MemoryStore::builder()
//!     .page_size(2)
//!     .policy(ManagedPolicy::new("p-1", "ec2-readonly"))
//!     .role(IdentityRole::new("r-1", "ops").with_tag("team", "ops").attached_to("p-1"))
//!     .build();
//! store.fail(Op::Tag, Some("p-1"), StoreError::PermissionDenied("tag".into()), None);
//! ```

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tagsync_core::{
    IdentityRole, ManagedPolicy, PolicyPage, ResourceStore, StoreError, TagMap,
};

/// Store operation, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ListPolicies,
    ListRoles,
    Tag,
    Untag,
    Update,
}

impl Op {
    /// Whether the operation writes to the store.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(self, Self::Tag | Self::Untag | Self::Update)
    }
}

/// One recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    ListPolicies { page_token: Option<String> },
    ListRoles { policy_id: String },
    Tag { policy_id: String, tags: TagMap },
    Untag { policy_id: String, keys: BTreeSet<String> },
    Update {
        policy_id: String,
        set: TagMap,
        remove: BTreeSet<String>,
    },
}

impl StoreCall {
    #[must_use]
    pub const fn op(&self) -> Op {
        match self {
            Self::ListPolicies { .. } => Op::ListPolicies,
            Self::ListRoles { .. } => Op::ListRoles,
            Self::Tag { .. } => Op::Tag,
            Self::Untag { .. } => Op::Untag,
            Self::Update { .. } => Op::Update,
        }
    }

    #[must_use]
    pub fn policy_id(&self) -> Option<&str> {
        match self {
            Self::ListPolicies { .. } => None,
            Self::ListRoles { policy_id }
            | Self::Tag { policy_id, .. }
            | Self::Untag { policy_id, .. }
            | Self::Update { policy_id, .. } => Some(policy_id),
        }
    }
}

type CallHook = Arc<dyn Fn(&StoreCall) + Send + Sync>;

#[derive(Debug, Clone)]
struct Fault {
    error: StoreError,
    /// Calls to let through before failing.
    skip: u32,
    /// Failures left; `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct State {
    policies: Vec<ManagedPolicy>,
    roles: Vec<IdentityRole>,
    faults: HashMap<(Op, Option<String>), Fault>,
    calls: Vec<StoreCall>,
}

impl State {
    /// Take the next injected failure for `op` on `policy_id`, preferring a
    /// policy-specific fault over a store-wide one.
    fn take_fault(&mut self, op: Op, policy_id: Option<&str>) -> Option<StoreError> {
        let specific = policy_id.map(|id| (op, Some(id.to_string())));
        let key = specific
            .filter(|k| self.faults.contains_key(k))
            .or_else(|| Some((op, None)).filter(|k| self.faults.contains_key(k)))?;

        let fault = self.faults.get_mut(&key)?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        let error = fault.error.clone();
        match fault.remaining {
            Some(0) => {
                self.faults.remove(&key);
                None
            }
            Some(1) => {
                self.faults.remove(&key);
                Some(error)
            }
            Some(n) => {
                fault.remaining = Some(n - 1);
                Some(error)
            }
            None => Some(error),
        }
    }

    fn policy_mut(&mut self, policy_id: &str) -> Result<&mut ManagedPolicy, StoreError> {
        self.policies
            .iter_mut()
            .find(|p| p.id == policy_id)
            .ok_or_else(|| StoreError::NotFound(policy_id.to_string()))
    }
}

/// In-memory resource store.
pub struct MemoryStore {
    state: Mutex<State>,
    page_size: usize,
    batched: bool,
    stuck_pagination: bool,
    latency: Option<Duration>,
    hook: Option<CallHook>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("page_size", &self.page_size)
            .field("batched", &self.batched)
            .field("stuck_pagination", &self.stuck_pagination)
            .finish_non_exhaustive()
    }
}

/// Builder for [`MemoryStore`].
#[derive(Default)]
pub struct MemoryStoreBuilder {
    policies: Vec<ManagedPolicy>,
    roles: Vec<IdentityRole>,
    page_size: Option<usize>,
    batched: bool,
    stuck_pagination: bool,
    latency: Option<Duration>,
    hook: Option<CallHook>,
}

impl MemoryStoreBuilder {
    #[must_use]
    pub fn policy(mut self, policy: ManagedPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    #[must_use]
    pub fn policies(mut self, policies: impl IntoIterator<Item = ManagedPolicy>) -> Self {
        self.policies.extend(policies);
        self
    }

    #[must_use]
    pub fn role(mut self, role: IdentityRole) -> Self {
        self.roles.push(role);
        self
    }

    /// Policies per listing page (default 100).
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Advertise and serve the combined update call.
    #[must_use]
    pub const fn batched(mut self, batched: bool) -> Self {
        self.batched = batched;
        self
    }

    /// Hand back the same non-empty page token forever.
    #[must_use]
    pub const fn stuck_pagination(mut self) -> Self {
        self.stuck_pagination = true;
        self
    }

    /// Sleep this long inside every call.
    #[must_use]
    pub const fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Run `hook` after each call is recorded.
    #[must_use]
    pub fn on_call(mut self, hook: impl Fn(&StoreCall) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn build(self) -> MemoryStore {
        MemoryStore {
            state: Mutex::new(State {
                policies: self.policies,
                roles: self.roles,
                ..State::default()
            }),
            page_size: self.page_size.unwrap_or(100).max(1),
            batched: self.batched,
            stuck_pagination: self.stuck_pagination,
            latency: self.latency,
            hook: self.hook,
        }
    }
}

impl MemoryStore {
    #[must_use]
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// Make `op` fail with `error`. `policy_id` of `None` applies to every
    /// policy; `times` of `None` fails forever.
    pub fn fail(&self, op: Op, policy_id: Option<&str>, error: StoreError, times: Option<u32>) {
        self.fail_after(op, policy_id, 0, error, times);
    }

    /// Like [`MemoryStore::fail`], but let `successes` calls through first.
    pub fn fail_after(
        &self,
        op: Op,
        policy_id: Option<&str>,
        successes: u32,
        error: StoreError,
        times: Option<u32>,
    ) {
        self.state.lock().faults.insert(
            (op, policy_id.map(str::to_string)),
            Fault {
                error,
                skip: successes,
                remaining: times,
            },
        );
    }

    /// Remove every injected fault.
    pub fn heal(&self) {
        self.state.lock().faults.clear();
    }

    /// Current state of a policy.
    #[must_use]
    pub fn policy(&self, policy_id: &str) -> Option<ManagedPolicy> {
        self.state
            .lock()
            .policies
            .iter()
            .find(|p| p.id == policy_id)
            .cloned()
    }

    /// Overwrite a role's tags, e.g. to simulate an operator edit between runs.
    pub fn set_role_tags(&self, role_id: &str, tags: TagMap) {
        if let Some(role) = self.state.lock().roles.iter_mut().find(|r| r.id == role_id) {
            role.tags = tags;
        }
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `op`.
    #[must_use]
    pub fn count(&self, op: Op) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op() == op)
            .count()
    }

    /// Number of calls of `op` against one policy.
    #[must_use]
    pub fn count_for(&self, op: Op, policy_id: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op() == op && c.policy_id() == Some(policy_id))
            .count()
    }

    /// Number of write calls.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op().is_mutation())
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Record `call`, fire the hook, and return any injected fault.
    async fn enter(&self, call: StoreCall) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let op = call.op();
        let policy_id = call.policy_id().map(str::to_string);
        let fault = {
            let mut state = self.state.lock();
            state.calls.push(call.clone());
            state.take_fault(op, policy_id.as_deref())
        };
        if let Some(hook) = &self.hook {
            hook(&call);
        }
        fault.map_or(Ok(()), Err)
    }
}

fn page_offset(token: Option<&str>) -> Result<usize, StoreError> {
    token.map_or(Ok(0), |t| {
        t.strip_prefix("offset-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| StoreError::Rejected(format!("bad page token '{t}'")))
    })
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_policies(&self, page_token: Option<&str>) -> Result<PolicyPage, StoreError> {
        self.enter(StoreCall::ListPolicies {
            page_token: page_token.map(str::to_string),
        })
        .await?;

        let offset = page_offset(page_token)?;
        let state = self.state.lock();
        let end = (offset + self.page_size).min(state.policies.len());
        let policies = state.policies.get(offset..end).unwrap_or_default().to_vec();
        let next_token = if self.stuck_pagination {
            Some(format!("offset-{}", self.page_size.min(state.policies.len())))
        } else if end < state.policies.len() {
            Some(format!("offset-{end}"))
        } else {
            None
        };
        Ok(PolicyPage {
            policies,
            next_token,
        })
    }

    async fn list_attached_roles(&self, policy_id: &str) -> Result<Vec<IdentityRole>, StoreError> {
        self.enter(StoreCall::ListRoles {
            policy_id: policy_id.to_string(),
        })
        .await?;

        let state = self.state.lock();
        if !state.policies.iter().any(|p| p.id == policy_id) {
            return Err(StoreError::NotFound(policy_id.to_string()));
        }
        Ok(state
            .roles
            .iter()
            .filter(|r| r.attached_policy_ids.contains(policy_id))
            .cloned()
            .collect())
    }

    async fn tag_policy(&self, policy_id: &str, tags: &TagMap) -> Result<(), StoreError> {
        self.enter(StoreCall::Tag {
            policy_id: policy_id.to_string(),
            tags: tags.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let policy = state.policy_mut(policy_id)?;
        policy
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn untag_policy(
        &self,
        policy_id: &str,
        keys: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.enter(StoreCall::Untag {
            policy_id: policy_id.to_string(),
            keys: keys.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let policy = state.policy_mut(policy_id)?;
        policy.tags.retain(|k, _| !keys.contains(k));
        Ok(())
    }

    fn supports_batched_update(&self) -> bool {
        self.batched
    }

    async fn update_policy_tags(
        &self,
        policy_id: &str,
        set: &TagMap,
        remove: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        if !self.batched {
            return Err(StoreError::Unsupported("update_policy_tags"));
        }
        self.enter(StoreCall::Update {
            policy_id: policy_id.to_string(),
            set: set.clone(),
            remove: remove.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let policy = state.policy_mut(policy_id)?;
        policy.tags.retain(|k, _| !remove.contains(k));
        policy
            .tags
            .extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Build a tag map from literal pairs.
#[must_use]
pub fn tags(pairs: &[(&str, &str)]) -> TagMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// `count` customer-managed policies named `policy-000`, `policy-001`, ...
/// with ids `p-000`, `p-001`, ...
#[must_use]
pub fn numbered_policies(count: usize) -> Vec<ManagedPolicy> {
    (0..count)
        .map(|i| ManagedPolicy::new(format!("p-{i:03}"), format!("policy-{i:03}")))
        .collect()
}

/// Install a test-friendly tracing subscriber once. Honors `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
