//! The reference [`HostBridge`] implementation: a [`CircularLog`]-backed
//! persistent store, a [`PeerThrottle`]-gated [`Transport`] sender, and a
//! [`DispatcherContext`] for replication/apply/pop notifications.
//!
//! Grounded on `cyclone.cpp`'s `cyclone_t`: the throttle lookup inside
//! `__send_appendentries`, the two-append-per-entry pairing in
//! `cyclone_deserialize_last_applied`, and the commit callback chain
//! (`cyclone_rep_cb` / `cyclone_pop_cb` / `cyclone_commit_cb`) that this
//! crate's [`DispatcherContext::on_replicate`] / `on_pop` / `on_apply`
//! mirror.

use std::collections::VecDeque;
use std::convert::TryInto;
use std::sync::Arc;

use crc32fast::Hasher;
use parking_lot::Mutex;

use crate::bridge::pack_append_entries_count;
use crate::bridge::HostBridge;
use crate::dispatcher::DispatcherContext;
use crate::error::HostError;
use crate::error::HostResult;
use crate::error::LogFull;
use crate::plog::CircularLog;
use crate::throttle::Decision;
use crate::throttle::PeerThrottle;
use crate::transport::Transport;
use crate::wire::AppendEntriesMsg;
use crate::wire::AppendEntriesResponseMsg;
use crate::wire::ClientMsg;
use crate::wire::Envelope;
use crate::wire::EntryKind;
use crate::wire::LogEntry;
use crate::wire::Msg;
use crate::wire::RequestVoteMsg;
use crate::wire::RequestVoteResponseMsg;
use crate::NodeId;
use crate::Term;

/// `{term, index, kind, payload_len, crc}`, serialized manually (not via
/// `bincode`) since the ring stores raw bytes and must know its own record
/// boundaries without depending on a serde format's stability.
const HEADER_LEN: usize = 8 + 8 + 1 + 4 + 4;

fn encode_header(entry: &LogEntry, crc: u32) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..8].copy_from_slice(&entry.term.to_le_bytes());
    buf[8..16].copy_from_slice(&entry.index.to_le_bytes());
    buf[16] = match entry.kind {
        EntryKind::User => 0,
        EntryKind::AddNonVoting => 1,
        EntryKind::AddVoting => 2,
        EntryKind::Remove => 3,
    };
    buf[17..21].copy_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    buf[21..25].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decodes a header read back from the ring. Returns `(term, index, kind,
/// payload_len, crc)`.
pub fn decode_header(buf: &[u8]) -> (Term, u64, EntryKind, usize, u32) {
    let term = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let index = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let kind = match buf[16] {
        0 => EntryKind::User,
        1 => EntryKind::AddNonVoting,
        2 => EntryKind::AddVoting,
        3 => EntryKind::Remove,
        other => panic!("corrupt entry header: unknown kind tag {}", other),
    };
    let len = u32::from_le_bytes(buf[17..21].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(buf[21..25].try_into().unwrap());
    (term, index, kind, len, crc)
}

pub const ENTRY_HEADER_LEN: usize = HEADER_LEN;

fn crc_of(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// The reference `HostBridge`: one per replica.
pub struct StandardBridge<T: Transport> {
    id: NodeId,
    plog: Arc<CircularLog>,
    /// `(header_len, payload_len)` per live entry, oldest first — lets
    /// `poll_log_entry`/`pop_log_entry` know exactly how many bytes to
    /// reclaim without re-parsing the ring.
    pending_lens: Mutex<VecDeque<(usize, usize)>>,
    throttle: Mutex<PeerThrottle>,
    transport: Arc<T>,
    dispatcher: Arc<DispatcherContext>,
}

impl<T: Transport> StandardBridge<T> {
    pub fn new(
        id: NodeId,
        plog: Arc<CircularLog>,
        request_timeout: std::time::Duration,
        transport: Arc<T>,
        dispatcher: Arc<DispatcherContext>,
    ) -> Self {
        StandardBridge {
            id,
            plog,
            pending_lens: Mutex::new(VecDeque::new()),
            throttle: Mutex::new(PeerThrottle::new(request_timeout)),
            transport,
            dispatcher,
        }
    }

    /// Used by [`crate::bootstrap`] during recovery replay to seed the
    /// length bookkeeping for entries already on disk, without
    /// re-persisting them.
    pub fn note_replayed(&self, header_len: usize, payload_len: usize) {
        self.pending_lens.lock().push_back((header_len, payload_len));
    }

    /// Blocks on the underlying transport for the driving loop. Not part
    /// of [`HostBridge`]: `RaftCore` never reads the transport directly,
    /// only the host-side driving loop that owns this bridge does.
    pub fn transport_recv(&self, timeout: std::time::Duration) -> Option<Envelope> {
        self.transport.recv(timeout)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Sends on the transport's checkpoint control channel. Not part of
    /// [`HostBridge`]: only [`crate::bootstrap`]'s late-join fetch and the
    /// driving loop's checkpoint responder touch the control channel.
    pub fn control_send(&self, to: NodeId, msg: crate::wire::CheckpointMsg) {
        let _ = self.transport.control_send(to, msg);
    }

    /// Non-blocking (pass `Duration::ZERO`) or blocking poll of the
    /// checkpoint control channel.
    pub fn control_recv(&self, timeout: std::time::Duration) -> Option<(NodeId, crate::wire::CheckpointMsg)> {
        self.transport.control_recv(timeout)
    }

    fn decode_client_msg(payload: &[u8]) -> Option<ClientMsg> {
        bincode::deserialize(payload).ok()
    }
}

impl<T: Transport> HostBridge for StandardBridge<T> {
    fn send_request_vote(&self, node: NodeId, msg: RequestVoteMsg) {
        let envelope = Envelope {
            source: self.id,
            msg: Msg::RequestVote(msg),
        };
        let _ = self.transport.send(node, envelope);
    }

    fn send_request_vote_response(&self, node: NodeId, msg: RequestVoteResponseMsg) {
        let envelope = Envelope {
            source: self.id,
            msg: Msg::RequestVoteResponse(msg),
        };
        let _ = self.transport.send(node, envelope);
    }

    fn send_append_entries_response(&self, node: NodeId, msg: AppendEntriesResponseMsg) {
        let envelope = Envelope {
            source: self.id,
            msg: Msg::AppendEntriesResponse(msg),
        };
        let _ = self.transport.send(node, envelope);
    }

    fn send_append_entries(&self, node: NodeId, msg: &AppendEntriesMsg) -> usize {
        let n = pack_append_entries_count(msg, ENTRY_HEADER_LEN, crate::wire::MSG_MAXSIZE);
        let decision = self.throttle.lock().poll(node, msg.prev_log_term, msg.prev_log_idx, n);
        if decision == Decision::Suppress {
            return 0;
        }
        let mut packed = msg.clone();
        packed.entries.truncate(n);
        let envelope = Envelope {
            source: self.id,
            msg: Msg::AppendEntries(packed),
        };
        let _ = self.transport.send(node, envelope);
        n
    }

    fn persist_term(&self, term: Term) -> HostResult<()> {
        self.plog.persist_term(term);
        Ok(())
    }

    fn persist_vote(&self, voted_for: Option<NodeId>) -> HostResult<()> {
        self.plog.persist_vote(voted_for);
        Ok(())
    }

    fn offer_log_entry(&self, entry: &LogEntry) -> HostResult<u64> {
        let crc = crc_of(&entry.payload);
        let header = encode_header(entry, crc);
        self.plog.append(&header).map_err(HostError::LogFull)?;
        let payload_offset = match self.plog.append(&entry.payload) {
            Ok(off) => off,
            Err(e) => {
                // Roll the header back out: the pair must be atomic.
                self.plog.pop_tail(HEADER_LEN);
                return Err(HostError::LogFull(e));
            }
        };
        self.pending_lens.lock().push_back((HEADER_LEN, entry.payload.len()));

        if entry.kind == EntryKind::User {
            if let Some(client_msg) = Self::decode_client_msg(&entry.payload) {
                self.dispatcher.on_replicate(&client_msg);
            }
        }
        Ok(payload_offset)
    }

    fn poll_log_entry(&self, _entry: &LogEntry) {
        let lens = self.pending_lens.lock().pop_front();
        if let Some((header_len, payload_len)) = lens {
            self.plog.poll_head(header_len);
            self.plog.poll_head(payload_len);
        }
    }

    fn pop_log_entry(&self, entry: &LogEntry, _payload_offset: u64) {
        let lens = self.pending_lens.lock().pop_back();
        if let Some((header_len, payload_len)) = lens {
            self.plog.pop_tail(payload_len);
            self.plog.pop_tail(header_len);
        }
        if entry.kind == EntryKind::User {
            if let Some(client_msg) = Self::decode_client_msg(&entry.payload) {
                self.dispatcher.on_pop(&client_msg);
            }
        }
    }

    fn apply_log(&self, entry: &LogEntry, payload_offset: u64) -> HostResult<()> {
        // The header's crc is verified once, at recovery replay time
        // (`bootstrap::replay`); applying trusts the in-memory `entry`.
        let bytes = self.plog.read(payload_offset, entry.payload.len());
        if entry.kind == EntryKind::User {
            match Self::decode_client_msg(&bytes) {
                Some(client_msg) => self
                    .dispatcher
                    .on_apply(&client_msg)
                    .map_err(|e| HostError::PersistFailed(e.to_string()))?,
                None => {
                    return Err(HostError::PersistFailed(format!(
                        "entry {} payload does not decode as a client message",
                        entry.index
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let entry = LogEntry {
            term: 7,
            index: 42,
            kind: EntryKind::AddVoting,
            payload: vec![1, 2, 3],
        };
        let crc = crc_of(&entry.payload);
        let header = encode_header(&entry, crc);
        let (term, index, kind, len, decoded_crc) = decode_header(&header);
        assert_eq!(term, 7);
        assert_eq!(index, 42);
        assert_eq!(kind, EntryKind::AddVoting);
        assert_eq!(len, 3);
        assert_eq!(decoded_crc, crc);
    }
}
