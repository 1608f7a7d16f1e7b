//! Remote resource store capability.
//!
//! The engine's only I/O surface. The trait deliberately offers no way to
//! write roles: synchronization is one-directional, and the principal the
//! engine runs under needs only list/describe on policies and roles plus
//! tag/untag on policies.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{IdentityRole, ManagedPolicy, TagMap};

/// One page of a policy listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPage {
    pub policies: Vec<ManagedPolicy>,
    /// Token for the next page; `None` once the listing is exhausted.
    #[serde(default)]
    pub next_token: Option<String>,
}

/// List/get/tag calls against the system that owns roles and policies.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch one page of policies. `None` requests the first page.
    async fn list_policies(&self, page_token: Option<&str>) -> Result<PolicyPage, StoreError>;

    /// List the roles (with their tags) attached to a policy.
    async fn list_attached_roles(&self, policy_id: &str) -> Result<Vec<IdentityRole>, StoreError>;

    /// Add or overwrite tags on a policy.
    async fn tag_policy(&self, policy_id: &str, tags: &TagMap) -> Result<(), StoreError>;

    /// Remove tag keys from a policy.
    async fn untag_policy(&self, policy_id: &str, keys: &BTreeSet<String>)
    -> Result<(), StoreError>;

    /// Whether [`ResourceStore::update_policy_tags`] is available.
    fn supports_batched_update(&self) -> bool {
        false
    }

    /// Set and remove tags in one call.
    async fn update_policy_tags(
        &self,
        policy_id: &str,
        set: &TagMap,
        remove: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let _ = (policy_id, set, remove);
        Err(StoreError::Unsupported("update_policy_tags"))
    }
}
