//! The host callbacks [`raft::RaftCore`](crate::raft::RaftCore) needs from
//! the world, collapsed into one capability interface (spec.md §4.3, §9
//! Design Notes: "avoid the opaque-user-data pattern of the source; pass the
//! host bridge by typed reference"). Eight of the ten methods are the
//! literal spec.md §4.3 enumeration; `send_request_vote_response` and
//! `send_append_entries_response` are added so `RaftCore` can reply to an
//! inbound RPC, not just originate one (see DESIGN.md).
//!
//! Every method here executes synchronously on the Raft thread. Methods
//! documented as durable return only after their write is flushed; `RaftCore`
//! must not proceed with a vote grant, an append acknowledgement, or a
//! commit until the corresponding `HostBridge` call returns successfully.

use crate::error::HostResult;
use crate::wire::AppendEntriesMsg;
use crate::wire::AppendEntriesResponseMsg;
use crate::wire::LogEntry;
use crate::wire::RequestVoteMsg;
use crate::wire::RequestVoteResponseMsg;
use crate::NodeId;
use crate::Term;

/// The single capability interface `RaftCore` is generic over.
pub trait HostBridge: Send + 'static {
    /// Serializes and enqueues a `RequestVote` on the transport. Not
    /// durable: losing this message is recovered by the election timeout.
    fn send_request_vote(&self, node: NodeId, msg: RequestVoteMsg);

    /// Replies to a `RequestVote` the host already delivered to `RaftCore`.
    fn send_request_vote_response(&self, node: NodeId, msg: RequestVoteResponseMsg);

    /// Sends (or, per [`crate::throttle::PeerThrottle`], suppresses) an
    /// AppendEntries to `node`. Implementations are expected to consult
    /// their own `PeerThrottle` here, per spec.md §4.3 item 2; `RaftCore`
    /// does not throttle on the caller's side. Entries are packed up to
    /// [`crate::wire::MSG_MAXSIZE`]; the number actually sent is returned
    /// so `RaftCore` knows what to expect an acknowledgement for and can
    /// retry the remainder — the caller's `msg` is never mutated in place.
    fn send_append_entries(&self, node: NodeId, msg: &AppendEntriesMsg) -> usize;

    /// Replies to an AppendEntries the host already delivered to `RaftCore`.
    /// Never throttled: suppressing an acknowledgement would stall the
    /// leader's view of this follower indefinitely.
    fn send_append_entries_response(&self, node: NodeId, msg: AppendEntriesResponseMsg);

    /// Transactionally persists `current_term`. Returns only after flush.
    fn persist_term(&self, term: Term) -> HostResult<()>;

    /// Transactionally persists `voted_for`. Returns only after flush.
    fn persist_vote(&self, voted_for: Option<NodeId>) -> HostResult<()>;

    /// Transactionally appends `entry`'s header and payload to the
    /// persistent log, returning the offset the payload was written at
    /// (the `entry.payload_ref` rewrite from spec.md §4.3 item 5 — offsets
    /// are handed back rather than mutated into the entry in place, since
    /// ownership of `entry` here is borrowed).
    ///
    /// For `User` entries this also delivers the replication callback:
    /// the host's dispatcher observes the entry's `client_txid` before
    /// commit, so a recovered follower's dispatcher stays in sync with the
    /// leader's view of `seen_client_txid` (spec.md §4.5).
    fn offer_log_entry(&self, entry: &LogEntry) -> HostResult<u64>;

    /// Removes the header and payload of the head-most (oldest) entry.
    fn poll_log_entry(&self, entry: &LogEntry);

    /// Removes the header and payload of the tail-most (newest,
    /// necessarily uncommitted) entry, and for `User` entries delivers the
    /// pop callback so the dispatcher can roll back its tentative
    /// `seen_client_txid` bump.
    fn pop_log_entry(&self, entry: &LogEntry, payload_offset: u64);

    /// Reads `entry`'s payload back from the persistent log at
    /// `payload_offset` and delivers it to the host's Apply callback. Runs
    /// in the same durable transaction as the dispatcher's per-client
    /// `committed_txid` update (spec.md §4.5) — this is the exactly-once
    /// guarantee.
    fn apply_log(&self, entry: &LogEntry, payload_offset: u64) -> HostResult<()>;
}

/// Packs as many `(header, payload)` pairs from `msg.entries` as fit within
/// `budget` bytes, returning the count actually packed.
///
/// A faithful rewrite of the packing loop must not mutate the caller's
/// in-memory message in place to reflect the truncation (spec.md §9 Open
/// Question (a)) — callers take the returned count and slice `msg.entries`
/// themselves if they need the packed subset.
pub fn pack_append_entries_count(msg: &AppendEntriesMsg, header_size: usize, budget: usize) -> usize {
    let mut used = 0usize;
    let mut n = 0usize;
    for entry in &msg.entries {
        let cost = header_size + entry.payload.len();
        if used + cost > budget {
            break;
        }
        used += cost;
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::EntryKind;

    fn entry(payload_len: usize) -> LogEntry {
        LogEntry {
            term: 1,
            index: 1,
            kind: EntryKind::User,
            payload: vec![0u8; payload_len],
        }
    }

    #[test]
    fn packs_everything_when_it_fits() {
        let msg = AppendEntriesMsg {
            term: 1,
            prev_log_idx: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![entry(10), entry(10)],
        };
        assert_eq!(pack_append_entries_count(&msg, 8, 1000), 2);
    }

    #[test]
    fn truncates_to_what_fits_without_mutating_input() {
        let msg = AppendEntriesMsg {
            term: 1,
            prev_log_idx: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![entry(10), entry(10), entry(10)],
        };
        let budget = 8 + 10 + 8 + 10; // exactly two entries
        assert_eq!(pack_append_entries_count(&msg, 8, budget), 2);
        assert_eq!(msg.entries.len(), 3, "caller's message must be left untouched");
    }
}
