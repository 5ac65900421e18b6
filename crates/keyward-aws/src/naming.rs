//! Generated IAM user names.
//!
//! Names look like `vault-<display>-<unix>-<n>` for federation tokens and
//! `vault-<display>-<policy>-<unix>-<n>` for durable users, where `<n>` is a
//! random suffix below 10000. Clock and randomness are injected so tests can
//! pin the exact result.

use std::sync::Arc;

use rand::Rng;

use crate::clock::Clock;

/// Prefix of every generated user name.
pub const USERNAME_PREFIX: &str = "vault";
/// Exclusive upper bound of the random suffix.
pub const SUFFIX_BOUND: u32 = 10_000;

/// Characters the identity provider accepts in a user name, besides ASCII alphanumerics.
const ALLOWED_PUNCTUATION: &[char] = &['+', '=', ',', '.', '@', '_', '-'];

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || ALLOWED_PUNCTUATION.contains(&c)
}

/// Replace every character outside `[A-Za-z0-9+=,.@_-]` with `_`.
pub fn normalize_display_name(display_name: &str) -> String {
    display_name
        .chars()
        .map(|c| if is_allowed(c) { c } else { '_' })
        .collect()
}

/// Source of the random name suffix.
pub trait RandomSource: Send + Sync {
    /// A value in `0..SUFFIX_BOUND`.
    fn suffix(&self) -> u32;
}

/// Thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn suffix(&self) -> u32 {
        rand::thread_rng().gen_range(0..SUFFIX_BOUND)
    }
}

/// Builds unique IAM user names.
#[derive(Clone)]
pub struct UsernameGenerator {
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
}

impl UsernameGenerator {
    pub fn new(clock: Arc<dyn Clock>, random: Arc<dyn RandomSource>) -> Self {
        Self { clock, random }
    }

    /// Name for the federation-token strategy. The policy is left out, the
    /// token carries it.
    pub fn federation_username(&self, display_name: &str) -> String {
        format!(
            "{}-{}-{}-{}",
            USERNAME_PREFIX,
            normalize_display_name(display_name),
            self.clock.now().timestamp(),
            self.random.suffix()
        )
    }

    /// Name for the durable-user strategy. The policy name is included so a
    /// user can be traced back to the role it was created for.
    pub fn user_username(&self, display_name: &str, policy_name: &str) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            USERNAME_PREFIX,
            normalize_display_name(display_name),
            normalize_display_name(policy_name),
            self.clock.now().timestamp(),
            self.random.suffix()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FixedClock, FixedRandom};
    use proptest::prelude::*;

    fn generator() -> UsernameGenerator {
        UsernameGenerator::new(
            Arc::new(FixedClock::at_timestamp(1_700_000_000)),
            Arc::new(FixedRandom(42)),
        )
    }

    #[test]
    fn normalize_keeps_allowed_characters() {
        assert_eq!(normalize_display_name("alice+ops=1,a.b@c_d-e"), "alice+ops=1,a.b@c_d-e");
    }

    #[test]
    fn normalize_replaces_disallowed_characters() {
        assert_eq!(normalize_display_name("token/alice smith"), "token_alice_smith");
        assert_eq!(normalize_display_name("ünïcode"), "_n_code");
        assert_eq!(normalize_display_name(""), "");
    }

    #[test]
    fn federation_username_layout() {
        assert_eq!(
            generator().federation_username("token/bob"),
            "vault-token_bob-1700000000-42"
        );
    }

    #[test]
    fn user_username_includes_policy() {
        assert_eq!(
            generator().user_username("alice", "read only"),
            "vault-alice-read_only-1700000000-42"
        );
    }

    #[test]
    fn thread_random_stays_in_bounds() {
        for _ in 0..1000 {
            assert!(ThreadRandom.suffix() < SUFFIX_BOUND);
        }
    }

    proptest! {
        #[test]
        fn normalized_names_use_only_allowed_characters(name in ".*") {
            prop_assert!(normalize_display_name(&name).chars().all(is_allowed));
        }

        #[test]
        fn normalize_is_idempotent(name in ".*") {
            let once = normalize_display_name(&name);
            prop_assert_eq!(normalize_display_name(&once), once);
        }

        #[test]
        fn normalize_preserves_character_count(name in ".*") {
            prop_assert_eq!(normalize_display_name(&name).chars().count(), name.chars().count());
        }
    }
}
