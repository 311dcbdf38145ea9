//! A watch-style metrics stream publishing [`RaftCore`](crate::raft::RaftCore)'s
//! role and progress after every state transition.
//!
//! async-raft exposes an equivalent `RaftMetrics` over a `tokio::sync::watch`
//! channel; Cyclone's core is synchronous, so the same shape is published
//! over a single-slot `crossbeam_channel` instead (last-value-wins, exactly
//! like `watch`).

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::raft::Role;
use crate::NodeId;
use crate::Term;

/// A point-in-time snapshot of one replica's consensus state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub commit_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
}

/// The publishing half, held by [`crate::raft::RaftCore`].
pub struct MetricsReporter {
    tx: Sender<RaftMetrics>,
    last: RaftMetrics,
}

impl MetricsReporter {
    pub fn new(id: NodeId) -> (Self, Receiver<RaftMetrics>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let last = RaftMetrics {
            id,
            role: Role::Follower,
            current_term: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
        };
        let _ = tx.try_send(last.clone());
        (MetricsReporter { tx, last }, rx)
    }

    /// Publishes `metrics` if it differs from the last published value.
    /// Never blocks: a full channel means nobody has consumed the previous
    /// snapshot yet, so it is drained and replaced in place.
    pub fn publish(&mut self, metrics: RaftMetrics) {
        if metrics == self.last {
            return;
        }
        self.last = metrics.clone();
        if self.tx.try_send(metrics.clone()).is_err() {
            let _ = self.tx.try_recv();
            let _ = self.tx.try_send(metrics);
        }
    }
}
