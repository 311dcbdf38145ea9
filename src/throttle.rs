//! Per-peer suppression of redundant AppendEntries retransmissions
//! (spec.md §4.4).
//!
//! Raft retransmits AppendEntries aggressively on any timer tick where a
//! follower hasn't yet acknowledged the leader's current view of its log.
//! On a slow follower, or a transport with momentary congestion, this turns
//! into a retransmission storm. The throttle suppresses an AE whose
//! `(prev_log_idx, prev_log_term)` and heartbeat-or-not status match the
//! previous one sent to that peer, until an exponentially growing timeout
//! expires.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use crate::NodeId;
use crate::Term;

/// The log point and shape of the last AppendEntries sent to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct View {
    prev_log_term: Term,
    prev_log_idx: u64,
    is_heartbeat: bool,
}

struct PeerThrottleState {
    last_view: Option<View>,
    last_tx_time: Instant,
    timeout: Duration,
}

/// What [`PeerThrottle::poll`] decided to do with a candidate AppendEntries.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    /// Send it, and update the throttle's bookkeeping as having just sent.
    Send,
    /// Suppress it; an equivalent AE was already sent recently enough.
    Suppress,
}

/// Per-peer throttle registry, one [`PeerThrottleState`] per non-self node.
pub struct PeerThrottle {
    request_timeout: Duration,
    peers: HashMap<NodeId, PeerThrottleState>,
}

impl PeerThrottle {
    pub fn new(request_timeout: Duration) -> Self {
        PeerThrottle {
            request_timeout,
            peers: HashMap::new(),
        }
    }

    fn state_for(&mut self, node: NodeId) -> &mut PeerThrottleState {
        let timeout = self.request_timeout / 2;
        self.peers.entry(node).or_insert_with(|| PeerThrottleState {
            last_view: None,
            last_tx_time: Instant::now(),
            timeout,
        })
    }

    /// Decide whether to send an AppendEntries with the given log point and
    /// entry count to `node` right now.
    ///
    /// Heartbeats (`n_entries == 0`) and entry-carrying AEs are never
    /// considered the same view even at an identical log point, matching
    /// the original's `prev_was_heartbeat == current_is_heartbeat` check.
    pub fn poll(&mut self, node: NodeId, prev_log_term: Term, prev_log_idx: u64, n_entries: usize) -> Decision {
        let request_timeout = self.request_timeout;
        let view = View {
            prev_log_term,
            prev_log_idx,
            is_heartbeat: n_entries == 0,
        };
        let state = self.state_for(node);
        let same_view = state.last_view == Some(view);
        let now = Instant::now();
        if same_view {
            if now.duration_since(state.last_tx_time) <= state.timeout {
                return Decision::Suppress;
            }
            state.timeout *= 2;
        } else {
            state.timeout = request_timeout / 2;
            state.last_view = Some(view);
        }
        state.last_tx_time = now;
        Decision::Send
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_send_to_a_peer_always_goes_through() {
        let mut t = PeerThrottle::new(Duration::from_millis(100));
        assert_eq!(t.poll(1, 1, 5, 2), Decision::Send);
    }

    #[test]
    fn repeat_of_same_view_is_suppressed_until_timeout() {
        let mut t = PeerThrottle::new(Duration::from_millis(20));
        assert_eq!(t.poll(1, 1, 5, 2), Decision::Send);
        assert_eq!(t.poll(1, 1, 5, 2), Decision::Suppress);
    }

    #[test]
    fn heartbeat_and_entry_bearing_ae_are_different_views() {
        let mut t = PeerThrottle::new(Duration::from_millis(100));
        assert_eq!(t.poll(1, 1, 5, 0), Decision::Send);
        // Same log point, but this one carries entries: not the same view.
        assert_eq!(t.poll(1, 1, 5, 3), Decision::Send);
    }

    #[test]
    fn view_change_resets_timeout_to_half_request_timeout() {
        let mut t = PeerThrottle::new(Duration::from_millis(40));
        assert_eq!(t.poll(1, 1, 5, 2), Decision::Send);
        std::thread::sleep(Duration::from_millis(5));
        // Suppressed: timeout is 20ms and only 5ms elapsed.
        assert_eq!(t.poll(1, 1, 5, 2), Decision::Suppress);
        // View changes (index advances): always sent, regardless of elapsed time.
        assert_eq!(t.poll(1, 1, 6, 2), Decision::Send);
    }

    #[test]
    fn timeout_doubles_on_each_suppressed_then_released_retransmission() {
        let mut t = PeerThrottle::new(Duration::from_millis(10));
        assert_eq!(t.poll(1, 1, 5, 2), Decision::Send);
        std::thread::sleep(Duration::from_millis(6));
        assert_eq!(t.poll(1, 1, 5, 2), Decision::Send); // timeout was 5ms, 6ms elapsed
        std::thread::sleep(Duration::from_millis(6));
        // timeout just doubled to 10ms; 6ms elapsed is not enough yet.
        assert_eq!(t.poll(1, 1, 5, 2), Decision::Suppress);
    }
}
