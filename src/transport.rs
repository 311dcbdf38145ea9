//! The wire transport contract (spec.md §1: "a reliable point-to-point
//! message bus between peer endpoints"). Explicitly out of scope for this
//! crate — a real deployment plugs in its own reliable transport — but the
//! [`Transport`] trait gives [`crate::bridge::HostBridge`] impls and tests a
//! concrete seam to depend on, and [`LoopbackTransport`] is the in-process
//! implementation used by the integration tests and by a leader's
//! self-directed AppendEntries (spec.md §5).

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::wire::CheckpointMsg;
use crate::wire::Envelope;
use crate::NodeId;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("no route to node {0}")]
    NoRoute(NodeId),
    #[error("datagram dropped")]
    Dropped,
}

/// A reliable point-to-point message bus between peer endpoints.
///
/// `send` is fire-and-forget (spec.md §5); delivery failures are invisible
/// to Raft and recovered from via the election timeout and
/// [`crate::throttle::PeerThrottle`]'s retransmission, not via this trait's
/// error type.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), TransportError>;

    /// Blocks until a datagram arrives or `timeout` elapses.
    fn recv(&self, timeout: Duration) -> Option<Envelope>;

    /// Sends on the separate control channel used for late-join checkpoint
    /// request/install traffic (spec.md §8), kept apart from `send` so a
    /// checkpoint request never queues behind regular peer RPCs.
    fn control_send(&self, to: NodeId, msg: CheckpointMsg) -> Result<(), TransportError>;

    /// Blocks until a control datagram arrives or `timeout` elapses.
    fn control_recv(&self, timeout: Duration) -> Option<(NodeId, CheckpointMsg)>;
}

/// An in-process transport connecting a fixed set of [`NodeId`]s via
/// `crossbeam_channel`, used by `tests/fixtures` and by a leader's loopback
/// to itself. Never drops a message — so tests exercise Raft's safety
/// properties without also fighting transport flakiness, which is the
/// point: transport loss is this crate's non-goal to simulate.
pub struct LoopbackTransport {
    me: NodeId,
    inboxes: HashMap<NodeId, Sender<Envelope>>,
    rx: Receiver<Envelope>,
    control_inboxes: HashMap<NodeId, Sender<(NodeId, CheckpointMsg)>>,
    control_rx: Receiver<(NodeId, CheckpointMsg)>,
}

impl LoopbackTransport {
    /// Builds one connected `LoopbackTransport` per id in `nodes`.
    pub fn cluster(nodes: &[NodeId]) -> HashMap<NodeId, LoopbackTransport> {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        let mut control_senders = HashMap::new();
        let mut control_receivers = HashMap::new();
        for &id in nodes {
            let (tx, rx) = crossbeam_channel::unbounded();
            senders.insert(id, tx);
            receivers.insert(id, rx);
            let (ctx, crx) = crossbeam_channel::unbounded();
            control_senders.insert(id, ctx);
            control_receivers.insert(id, crx);
        }
        nodes
            .iter()
            .map(|&id| {
                (
                    id,
                    LoopbackTransport {
                        me: id,
                        inboxes: senders.clone(),
                        rx: receivers.remove(&id).unwrap(),
                        control_inboxes: control_senders.clone(),
                        control_rx: control_receivers.remove(&id).unwrap(),
                    },
                )
            })
            .collect()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), TransportError> {
        debug_assert_eq!(envelope.source, self.me);
        self.inboxes
            .get(&to)
            .ok_or(TransportError::NoRoute(to))?
            .send(envelope)
            .map_err(|_| TransportError::NoRoute(to))
    }

    fn recv(&self, timeout: Duration) -> Option<Envelope> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn control_send(&self, to: NodeId, msg: CheckpointMsg) -> Result<(), TransportError> {
        self.control_inboxes
            .get(&to)
            .ok_or(TransportError::NoRoute(to))?
            .send((self.me, msg))
            .map_err(|_| TransportError::NoRoute(to))
    }

    fn control_recv(&self, timeout: Duration) -> Option<(NodeId, CheckpointMsg)> {
        self.control_rx.recv_timeout(timeout).ok()
    }
}
