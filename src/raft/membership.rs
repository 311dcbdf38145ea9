//! Cluster membership: the voting and non-voting sets, mutated by
//! `ADD_NONVOTING`/`ADD_VOTING`/`REMOVE` log entries (spec.md §4.2).
//!
//! Additions take effect as soon as their entry is appended to the log
//! (standard single-server membership-change semantics), so they must be
//! reversible if that entry is later popped for conflicting with a new
//! leader's log. `REMOVE` is conservative by contrast: it only takes effect
//! once the entry is committed and applied, since removing a node can be
//! the difference between reaching quorum or not, and because a
//! self-removal drives process exit — an action that must never be undone.

use std::collections::BTreeSet;

use crate::wire::EntryKind;
use crate::NodeId;

#[derive(Clone, Debug, Default)]
pub struct Membership {
    pub voting: BTreeSet<NodeId>,
    pub non_voting: BTreeSet<NodeId>,
}

impl Membership {
    pub fn new_initial(id: NodeId) -> Self {
        let mut voting = BTreeSet::new();
        voting.insert(id);
        Membership {
            voting,
            non_voting: BTreeSet::new(),
        }
    }

    pub fn quorum_size(&self) -> usize {
        self.voting.len() / 2 + 1
    }

    pub fn is_voting(&self, node: NodeId) -> bool {
        self.voting.contains(&node)
    }

    /// Applies the offer-time effect of appending a config-change entry.
    /// `REMOVE` is handled separately at apply time by the caller.
    pub fn apply_offer(&mut self, kind: EntryKind, node: NodeId) {
        match kind {
            EntryKind::AddNonVoting => {
                if !self.voting.contains(&node) {
                    self.non_voting.insert(node);
                }
            }
            EntryKind::AddVoting => {
                self.non_voting.remove(&node);
                self.voting.insert(node);
            }
            EntryKind::User | EntryKind::Remove => {}
        }
    }

    /// Reverses [`Membership::apply_offer`] when its entry is popped from
    /// the tail for conflicting with a new leader's log.
    pub fn undo_offer(&mut self, kind: EntryKind, node: NodeId) {
        match kind {
            EntryKind::AddNonVoting => {
                self.non_voting.remove(&node);
            }
            EntryKind::AddVoting => {
                self.voting.remove(&node);
                self.non_voting.insert(node);
            }
            EntryKind::User | EntryKind::Remove => {}
        }
    }

    /// Applies a committed `REMOVE`. Returns `true` if `node` was a member
    /// beforehand.
    pub fn apply_remove(&mut self, node: NodeId) -> bool {
        let was_member = self.voting.remove(&node) | self.non_voting.remove(&node);
        was_member
    }

    pub fn all_members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.voting.iter().copied().chain(self.non_voting.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_nonvoting_then_promote() {
        let mut m = Membership::new_initial(0);
        m.apply_offer(EntryKind::AddNonVoting, 1);
        assert!(m.non_voting.contains(&1));
        assert!(!m.is_voting(1));
        m.apply_offer(EntryKind::AddVoting, 1);
        assert!(m.is_voting(1));
        assert!(!m.non_voting.contains(&1));
    }

    #[test]
    fn undo_reverses_add_nonvoting() {
        let mut m = Membership::new_initial(0);
        m.apply_offer(EntryKind::AddNonVoting, 1);
        m.undo_offer(EntryKind::AddNonVoting, 1);
        assert!(!m.non_voting.contains(&1));
        assert!(!m.is_voting(1));
    }

    #[test]
    fn undo_reverses_promote_back_to_nonvoting() {
        let mut m = Membership::new_initial(0);
        m.apply_offer(EntryKind::AddNonVoting, 1);
        m.apply_offer(EntryKind::AddVoting, 1);
        m.undo_offer(EntryKind::AddVoting, 1);
        assert!(!m.is_voting(1));
        assert!(m.non_voting.contains(&1));
    }

    #[test]
    fn quorum_size_is_majority_of_voters() {
        let mut m = Membership::new_initial(0);
        m.apply_offer(EntryKind::AddVoting, 1);
        m.apply_offer(EntryKind::AddVoting, 2);
        assert_eq!(m.quorum_size(), 2);
    }
}
