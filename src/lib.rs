//! Cyclone turns a single-node persistent-memory application into a
//! fault-tolerant replicated service, ordering client commands through a
//! Raft consensus log whose entries are durably appended to a
//! persistent-memory circular log.
//!
//! The crate is organized around a single capability interface,
//! [`bridge::HostBridge`], that [`raft::RaftCore`] consumes for everything
//! it needs from the outside world: sending peer RPCs, persisting votes and
//! terms, and offering/polling/popping/applying log entries. A host wires
//! its own [`plog::CircularLog`]-backed storage and a
//! [`transport::Transport`] together behind one `HostBridge` impl and hands
//! it to [`bootstrap::boot`].
//!
//! [`dispatcher::DispatcherContext`] sits in front of `RaftCore` and gates
//! client requests by per-client transaction id, giving exactly-once
//! application semantics across restarts.

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod plog;
pub mod raft;
pub mod standard_bridge;
pub mod throttle;
pub mod transport;
pub mod wire;

/// Identifies a replica within the cluster. Stable across restarts.
pub type NodeId = u32;

/// A Raft term number.
pub type Term = u64;

/// `(term, index)` identifying a point in the log, matching async-raft's
/// `LogId` shape (spec.md leaves this implicit; naming it makes commit
/// comparisons `(term, index)`-ordered rather than index-only, which is
/// required for the Leader Completeness property).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogId {
    pub term: Term,
    pub index: u64,
}

impl LogId {
    pub const ZERO: LogId = LogId { term: 0, index: 0 };
}
