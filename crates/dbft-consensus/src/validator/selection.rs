use super::set::ValidatorSet;
use dbft_primitives::{Height, ProposalSlot, ValidatorIndex, View};

/// What the local node is allowed to do in a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Owner of proposal slot 0; proposes first.
    PriorityPrimary,
    /// Owner of proposal slot 1; proposes after the priority delay lapses.
    FallbackPrimary,
    /// Validator without a proposal slot this view.
    Backup,
    /// Not part of the current set; observes and never signs.
    WatchOnly,
}

/// Deterministic dual-primary selection.
///
/// The priority primary for view `v` at height `h` is `(h - v) mod n`, so a
/// view change walks the primary backwards through the set; the fallback is
/// the next validator in order. Every honest node computes the same pair
/// with no communication.
#[derive(Debug, Clone)]
pub struct PrimarySelector;

impl PrimarySelector {
    pub fn priority_index(height: Height, view: View, set: &ValidatorSet) -> ValidatorIndex {
        let n = set.len() as i64;
        if n == 0 {
            return 0;
        }
        (height as i64 - view as i64).rem_euclid(n) as ValidatorIndex
    }

    pub fn fallback_index(height: Height, view: View, set: &ValidatorSet) -> ValidatorIndex {
        let n = set.len();
        if n == 0 {
            return 0;
        }
        (Self::priority_index(height, view, set) + 1) % n
    }

    /// Primary that owns `slot` in the given round.
    pub fn primary_for_slot(
        slot: ProposalSlot,
        height: Height,
        view: View,
        set: &ValidatorSet,
    ) -> ValidatorIndex {
        match slot {
            ProposalSlot::Priority => Self::priority_index(height, view, set),
            ProposalSlot::Fallback => Self::fallback_index(height, view, set),
        }
    }

    pub fn role_of(
        index: Option<ValidatorIndex>,
        height: Height,
        view: View,
        set: &ValidatorSet,
    ) -> Role {
        let Some(index) = index else {
            return Role::WatchOnly;
        };
        if !set.contains(index) {
            return Role::WatchOnly;
        }
        if index == Self::priority_index(height, view, set) {
            Role::PriorityPrimary
        } else if index == Self::fallback_index(height, view, set) {
            Role::FallbackPrimary
        } else {
            Role::Backup
        }
    }

    /// Slot the given validator owns in this round, if any.
    pub fn slot_of(
        index: ValidatorIndex,
        height: Height,
        view: View,
        set: &ValidatorSet,
    ) -> Option<ProposalSlot> {
        match Self::role_of(Some(index), height, view, set) {
            Role::PriorityPrimary => Some(ProposalSlot::Priority),
            Role::FallbackPrimary => Some(ProposalSlot::Fallback),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn make_set(n: u8) -> ValidatorSet {
        let keys = (0..n)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[0] = i;
                SigningKey::from_bytes(&bytes).verifying_key()
            })
            .collect();
        ValidatorSet::new(keys)
    }

    #[test]
    fn test_priority_walks_backwards_per_view() {
        let set = make_set(4);
        // Height 10: views 0..=3 select primaries 2, 1, 0, 3.
        assert_eq!(PrimarySelector::priority_index(10, 0, &set), 2);
        assert_eq!(PrimarySelector::priority_index(10, 1, &set), 1);
        assert_eq!(PrimarySelector::priority_index(10, 2, &set), 0);
        assert_eq!(PrimarySelector::priority_index(10, 3, &set), 3);
    }

    #[test]
    fn test_priority_handles_view_above_height() {
        let set = make_set(4);
        // 2 - 5 = -3, which wraps to 1 under euclidean remainder.
        assert_eq!(PrimarySelector::priority_index(2, 5, &set), 1);
    }

    #[test]
    fn test_fallback_is_next_in_order() {
        let set = make_set(4);
        assert_eq!(PrimarySelector::fallback_index(10, 0, &set), 3);
        // Wraparound: priority 3 at view 3 gives fallback 0.
        assert_eq!(PrimarySelector::fallback_index(10, 3, &set), 0);
    }

    #[test]
    fn test_roles_cover_all_validators() {
        let set = make_set(4);
        let roles: Vec<Role> = (0..4)
            .map(|i| PrimarySelector::role_of(Some(i), 10, 0, &set))
            .collect();
        assert_eq!(
            roles,
            vec![
                Role::Backup,
                Role::Backup,
                Role::PriorityPrimary,
                Role::FallbackPrimary
            ]
        );
    }

    #[test]
    fn test_watch_only_roles() {
        let set = make_set(4);
        assert_eq!(PrimarySelector::role_of(None, 10, 0, &set), Role::WatchOnly);
        // Index outside the set is also watch-only.
        assert_eq!(
            PrimarySelector::role_of(Some(9), 10, 0, &set),
            Role::WatchOnly
        );
    }

    #[test]
    fn test_slot_of() {
        let set = make_set(4);
        assert_eq!(
            PrimarySelector::slot_of(2, 10, 0, &set),
            Some(ProposalSlot::Priority)
        );
        assert_eq!(
            PrimarySelector::slot_of(3, 10, 0, &set),
            Some(ProposalSlot::Fallback)
        );
        assert_eq!(PrimarySelector::slot_of(0, 10, 0, &set), None);
    }
}
