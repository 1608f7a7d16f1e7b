//! Core data model: identity roles, managed policies and mutation plans.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Tag key → value mapping. Ordered so that logs and plans are deterministic.
pub type TagMap = BTreeMap<String, String>;

/// A principal whose tags are the source of truth. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRole {
    /// Stable role identifier (e.g. an ARN).
    pub id: String,
    /// Human-readable role name.
    pub name: String,
    /// Current role tags.
    #[serde(default)]
    pub tags: TagMap,
    /// Policies this role references.
    #[serde(default)]
    pub attached_policy_ids: BTreeSet<String>,
}

impl IdentityRole {
    /// Create a role with no tags and no attachments.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags: TagMap::new(),
            attached_policy_ids: BTreeSet::new(),
        }
    }

    /// Builder: add a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder: attach a policy.
    #[must_use]
    pub fn attached_to(mut self, policy_id: impl Into<String>) -> Self {
        self.attached_policy_ids.insert(policy_id.into());
        self
    }
}

/// Who owns a policy document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    /// Authored in the account; taggable by the engine.
    #[default]
    CustomerManaged,
    /// Published by the platform provider; never a sync target.
    ProviderManaged,
}

/// A reusable permission document whose tags the engine converges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedPolicy {
    /// Stable policy identifier (e.g. an ARN).
    pub id: String,
    /// Policy name; used by the target filter.
    pub name: String,
    /// Ownership scope.
    #[serde(default)]
    pub scope: PolicyScope,
    /// Current policy tags.
    #[serde(default)]
    pub tags: TagMap,
    /// Roles referencing this policy, when the store reports them.
    #[serde(default)]
    pub attaching_role_ids: BTreeSet<String>,
}

impl ManagedPolicy {
    /// Create a customer-managed policy with no tags.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            scope: PolicyScope::CustomerManaged,
            tags: TagMap::new(),
            attaching_role_ids: BTreeSet::new(),
        }
    }

    /// Builder: add a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder: set the scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: PolicyScope) -> Self {
        self.scope = scope;
        self
    }

    /// Whether the engine may write tags to this policy.
    #[must_use]
    pub const fn is_customer_managed(&self) -> bool {
        matches!(self.scope, PolicyScope::CustomerManaged)
    }
}

/// Minimal set of tag writes converging one policy.
///
/// `to_set` and `to_remove` never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMutationPlan {
    policy_id: String,
    to_set: TagMap,
    to_remove: BTreeSet<String>,
}

impl TagMutationPlan {
    /// Build a plan. A key present in both sets is kept only in `to_set`.
    #[must_use]
    pub fn new(policy_id: impl Into<String>, to_set: TagMap, mut to_remove: BTreeSet<String>) -> Self {
        to_remove.retain(|key| !to_set.contains_key(key));
        Self {
            policy_id: policy_id.into(),
            to_set,
            to_remove,
        }
    }

    /// A plan that changes nothing.
    #[must_use]
    pub fn noop(policy_id: impl Into<String>) -> Self {
        Self::new(policy_id, TagMap::new(), BTreeSet::new())
    }

    #[must_use]
    pub fn policy_id(&self) -> &str {
        &self.policy_id
    }

    /// Tags to add or overwrite.
    #[must_use]
    pub const fn to_set(&self) -> &TagMap {
        &self.to_set
    }

    /// Tag keys to delete.
    #[must_use]
    pub const fn to_remove(&self) -> &BTreeSet<String> {
        &self.to_remove
    }

    /// True when applying the plan would not change the policy.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.to_set.is_empty() && self.to_remove.is_empty()
    }

    /// Number of individual tag changes.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.to_set.len() + self.to_remove.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_keeps_sets_disjoint() {
        let to_set = TagMap::from([("env".to_string(), "prod".to_string())]);
        let to_remove = BTreeSet::from(["env".to_string(), "stale".to_string()]);
        let plan = TagMutationPlan::new("p-1", to_set, to_remove);

        assert_eq!(plan.to_set().len(), 1);
        assert_eq!(
            plan.to_remove().iter().collect::<Vec<_>>(),
            vec!["stale"]
        );
        assert_eq!(plan.change_count(), 2);
    }

    #[test]
    fn noop_plan_is_empty() {
        let plan = TagMutationPlan::noop("p-1");
        assert!(plan.is_noop());
        assert_eq!(plan.policy_id(), "p-1");
    }

    #[test]
    fn policy_defaults_to_customer_managed_when_scope_missing() {
        let policy: ManagedPolicy =
            serde_json::from_str(r#"{"id":"arn:p","name":"p","tags":{"a":"1"}}"#).unwrap();
        assert!(policy.is_customer_managed());
        assert_eq!(policy.tags.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn provider_scope_round_trips_as_snake_case() {
        let policy = ManagedPolicy::new("arn:p", "p").with_scope(PolicyScope::ProviderManaged);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["scope"], "provider_managed");
    }
}
