//! Leader-side per-follower replication bookkeeping: `next_index` /
//! `match_index`, and the commit-index advance rule (spec.md §4.2: "The
//! commit index advances when a majority of match indices reach some index
//! with `term == current_term`").

use std::collections::BTreeMap;

use crate::raft::membership::Membership;
use crate::NodeId;

#[derive(Clone, Copy, Debug)]
pub struct FollowerProgress {
    /// Index of the next entry to send to this follower.
    pub next_index: u64,
    /// Highest index known to be replicated on this follower.
    pub match_index: u64,
}

/// Tracks [`FollowerProgress`] for every known peer while this node is
/// leader. Reset whenever a node becomes leader.
#[derive(Default)]
pub struct LeaderState {
    pub progress: BTreeMap<NodeId, FollowerProgress>,
}

impl LeaderState {
    pub fn new(members: impl Iterator<Item = NodeId>, last_log_index: u64) -> Self {
        let mut progress = BTreeMap::new();
        for id in members {
            progress.insert(
                id,
                FollowerProgress {
                    next_index: last_log_index + 1,
                    match_index: 0,
                },
            );
        }
        LeaderState { progress }
    }

    pub fn ensure_tracked(&mut self, node: NodeId, last_log_index: u64) {
        self.progress.entry(node).or_insert(FollowerProgress {
            next_index: last_log_index + 1,
            match_index: 0,
        });
    }

    pub fn forget(&mut self, node: NodeId) {
        self.progress.remove(&node);
    }

    pub fn on_append_response(&mut self, node: NodeId, success: bool, match_index: u64, next_probe: u64) {
        let entry = self.progress.entry(node).or_insert(FollowerProgress {
            next_index: next_probe,
            match_index: 0,
        });
        if success {
            entry.match_index = entry.match_index.max(match_index);
            entry.next_index = entry.match_index + 1;
        } else {
            // Back off by one and retry from there next tick, the classic
            // (if slow) Raft conflict-resolution strategy.
            entry.next_index = entry.next_index.saturating_sub(1).max(1);
        }
    }

    /// The highest index present on a majority of `membership`'s voting
    /// members, including the leader itself via `self_id`/`self_match_index`.
    pub fn majority_match_index(&self, membership: &Membership, self_id: NodeId, self_match_index: u64) -> u64 {
        let mut indices: Vec<u64> = membership
            .voting
            .iter()
            .map(|&id| {
                if id == self_id {
                    self_match_index
                } else {
                    self.progress.get(&id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        indices.sort_unstable();
        indices[(indices.len() - 1) / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_leader_state_initializes_next_index_past_the_log() {
        let st = LeaderState::new(vec![1, 2].into_iter(), 10);
        assert_eq!(st.progress[&1].next_index, 11);
        assert_eq!(st.progress[&1].match_index, 0);
    }

    #[test]
    fn successful_response_advances_match_and_next_index() {
        let mut st = LeaderState::new(vec![1].into_iter(), 0);
        st.on_append_response(1, true, 5, 1);
        assert_eq!(st.progress[&1].match_index, 5);
        assert_eq!(st.progress[&1].next_index, 6);
    }

    #[test]
    fn failed_response_backs_off_next_index() {
        let mut st = LeaderState::new(vec![1].into_iter(), 10);
        st.on_append_response(1, false, 0, 11);
        assert_eq!(st.progress[&1].next_index, 10);
    }

    #[test]
    fn majority_match_index_needs_a_true_majority() {
        let mut m = Membership::new_initial(0);
        m.apply_offer(crate::wire::EntryKind::AddVoting, 1);
        m.apply_offer(crate::wire::EntryKind::AddVoting, 2);
        let mut st = LeaderState::new(vec![1, 2].into_iter(), 0);
        st.on_append_response(1, true, 5, 1);
        // Only leader (self) and node 1 are at index 5; node 2 is at 0.
        assert_eq!(st.majority_match_index(&m, 0, 5), 5);
        st.on_append_response(2, true, 5, 1);
        assert_eq!(st.majority_match_index(&m, 0, 5), 5);
    }
}
