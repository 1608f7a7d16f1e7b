//! Target tag resolution.
//!
//! A policy's target tag set is the union of the non-reserved tags of every
//! role attached to it. When two roles disagree on a key, the role with the
//! lexicographically smallest id wins. Discovery order carries no meaning,
//! so "last writer wins" would make the result depend on remote listing
//! order; the id rule makes it a pure function of the role set.

use crate::model::{IdentityRole, TagMap};
use crate::reserved::RESERVED_KEYS;

/// Compute the target tag set for a policy from its attached roles.
///
/// An empty role set resolves to an empty map, which converges the policy to
/// having no non-reserved tags.
#[must_use]
pub fn resolve<'a, I>(roles: I) -> TagMap
where
    I: IntoIterator<Item = &'a IdentityRole>,
{
    let mut ordered: Vec<&IdentityRole> = roles.into_iter().collect();
    // Duplicate ids fall back to comparing tag maps so the order stays total.
    ordered.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.tags.cmp(&b.tags)));

    let mut target = TagMap::new();
    for role in ordered {
        for (key, value) in &role.tags {
            if RESERVED_KEYS.is_reserved(key) {
                continue;
            }
            target
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn role(id: &str, tags: &[(&str, &str)]) -> IdentityRole {
        tags.iter()
            .fold(IdentityRole::new(id, id), |r, (k, v)| r.with_tag(*k, *v))
    }

    #[test]
    fn union_of_disjoint_tags() {
        let roles = [
            role("roleA", &[("env", "prod")]),
            role("roleB", &[("team", "x")]),
        ];
        let target = resolve(&roles);
        assert_eq!(
            target,
            TagMap::from([
                ("env".to_string(), "prod".to_string()),
                ("team".to_string(), "x".to_string()),
            ])
        );
    }

    #[test]
    fn smallest_role_id_wins_collision() {
        let forward = [role("b", &[("owner", "B")]), role("a", &[("owner", "A")])];
        let backward = [role("a", &[("owner", "A")]), role("b", &[("owner", "B")])];

        let expected = TagMap::from([("owner".to_string(), "A".to_string())]);
        assert_eq!(resolve(&forward), expected);
        assert_eq!(resolve(&backward), expected);
    }

    #[test]
    fn reserved_keys_are_dropped() {
        let roles = [role(
            "a",
            &[("aws:cloudformation:stack-name", "s"), ("env", "dev")],
        )];
        let target = resolve(&roles);
        assert_eq!(target.len(), 1);
        assert!(target.contains_key("env"));
    }

    #[test]
    fn no_roles_resolves_to_empty() {
        let target = resolve(std::iter::empty::<&IdentityRole>());
        assert!(target.is_empty());
    }

    fn arb_role() -> impl Strategy<Value = IdentityRole> {
        (
            "[a-d]{1,2}",
            prop::collection::btree_map("[a-c]", "[x-z]", 0..4),
        )
            .prop_map(|(id, tags)| {
                let mut role = IdentityRole::new(id.clone(), id);
                role.tags = tags;
                role
            })
    }

    proptest! {
        #[test]
        fn resolution_ignores_input_order(mut roles in prop::collection::vec(arb_role(), 0..6)) {
            let first = resolve(&roles);
            roles.reverse();
            let second = resolve(&roles);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn every_resolved_value_comes_from_smallest_carrier(roles in prop::collection::vec(arb_role(), 1..6)) {
            let target = resolve(&roles);
            for (key, value) in &target {
                let winner = roles
                    .iter()
                    .filter(|r| r.tags.contains_key(key))
                    .min_by(|a, b| a.id.cmp(&b.id).then_with(|| a.tags.cmp(&b.tags)))
                    .and_then(|r| r.tags.get(key));
                prop_assert_eq!(Some(value), winner);
            }
        }
    }
}
