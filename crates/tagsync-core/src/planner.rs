//! Diff between a policy's current tags and its target set.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{ManagedPolicy, TagMap, TagMutationPlan};
use crate::reserved::RESERVED_KEYS;

/// How far a run is allowed to move a policy toward its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Add, update and remove until the policy equals the target.
    #[default]
    Authoritative,
    /// Only add keys the policy lacks; never update or remove.
    Additive,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authoritative => write!(f, "authoritative"),
            Self::Additive => write!(f, "additive"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "authoritative" => Ok(Self::Authoritative),
            "additive" => Ok(Self::Additive),
            other => Err(format!(
                "unknown sync mode '{other}' (expected 'authoritative' or 'additive')"
            )),
        }
    }
}

/// Plan the authoritative convergence of `policy` onto `target`.
#[must_use]
pub fn plan(policy: &ManagedPolicy, target: &TagMap) -> TagMutationPlan {
    plan_with_mode(policy, target, SyncMode::Authoritative)
}

/// Plan the convergence of `policy` onto `target` under `mode`.
///
/// Reserved keys never appear in the plan, whatever either side holds.
#[must_use]
pub fn plan_with_mode(policy: &ManagedPolicy, target: &TagMap, mode: SyncMode) -> TagMutationPlan {
    let to_set: TagMap = target
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.is_reserved(key))
        .filter(|(key, value)| match policy.tags.get(*key) {
            None => true,
            Some(current) => mode == SyncMode::Authoritative && current != *value,
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let to_remove: BTreeSet<String> = match mode {
        SyncMode::Additive => BTreeSet::new(),
        SyncMode::Authoritative => policy
            .tags
            .keys()
            .filter(|key| !RESERVED_KEYS.is_reserved(key) && !target.contains_key(*key))
            .cloned()
            .collect(),
    };

    TagMutationPlan::new(policy.id.clone(), to_set, to_remove)
}
