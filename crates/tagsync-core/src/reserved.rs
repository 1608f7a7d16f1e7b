//! Tag keys owned by other systems.
//!
//! Reserved keys are excluded from the resolved target set and are never
//! written or removed on a policy. The set is static; it is not a run option.

/// A static set of reserved tag key prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedKeySet {
    prefixes: &'static [&'static str],
}

/// The platform reserves every key under `aws:` (case-insensitive).
pub const RESERVED_KEYS: ReservedKeySet = ReservedKeySet {
    prefixes: &["aws:"],
};

impl ReservedKeySet {
    /// Returns true if `key` must never be touched by synchronization.
    #[must_use]
    pub fn is_reserved(&self, key: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            key.len() >= prefix.len()
                && key.is_char_boundary(prefix.len())
                && key[..prefix.len()].eq_ignore_ascii_case(prefix)
        })
    }

    /// The reserved prefixes, for diagnostics.
    #[must_use]
    pub const fn prefixes(&self) -> &'static [&'static str] {
        self.prefixes
    }
}
