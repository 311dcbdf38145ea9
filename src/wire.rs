//! Wire formats exchanged over the [`crate::transport::Transport`] (peer
//! messages) and the [`crate::dispatcher::Dispatcher`] boundary (client
//! RPCs). See spec.md §6.

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;
use crate::Term;

/// `MSG_MAXSIZE` from spec.md §6: the packing budget for one AppendEntries
/// datagram. Entry headers are packed first, then payload blobs, in the
/// same order; packing truncates `n_entries` to what fits.
pub const MSG_MAXSIZE: usize = 64 * 1024;

/// One record in the replicated log, as carried on the wire and in
/// [`crate::plog::CircularLog`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub index: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

/// `LogEntry::type` from spec.md §3.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    User,
    AddNonVoting,
    AddVoting,
    Remove,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVoteMsg {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestVoteResponseMsg {
    pub term: Term,
    pub vote_granted: bool,
}

/// Fixed header for one AppendEntries datagram (spec.md §6); the entry
/// headers and payload blobs that follow are packed separately by
/// [`crate::bridge::pack_append_entries`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntriesMsg {
    pub term: Term,
    pub prev_log_idx: u64,
    pub prev_log_term: Term,
    pub leader_commit: u64,
    pub entries: Vec<LogEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendEntriesResponseMsg {
    pub term: Term,
    pub success: bool,
    /// Highest index this follower now holds, used by the leader to advance
    /// `next_index`/`match_index` without guessing.
    pub match_index: u64,
}

/// The per-client command envelope carried inside a replicated `User` entry
/// and across the Dispatcher boundary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientMsg {
    pub client_id: u32,
    pub client_txid: u64,
    pub global_txid: u64,
    pub payload: Vec<u8>,
}

/// `kind` of `struct msg` in spec.md §6.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Msg {
    RequestVote(RequestVoteMsg),
    RequestVoteResponse(RequestVoteResponseMsg),
    AppendEntries(AppendEntriesMsg),
    AppendEntriesResponse(AppendEntriesResponseMsg),
    ClientReq(ClientMsg),
    ClientReqCfg(ClientMsg),
    ClientReqTerm,
    ClientReqSetImgBuild,
    ClientReqUnsetImgBuild,
    ClientStatus(ClientMsg),
}

/// An envelope wrapping a [`Msg`] with its originating node, matching
/// `struct msg { source; kind; union {...} }` from spec.md §6.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub source: NodeId,
    pub msg: Msg,
}

/// The one-shot bootstrap image a late joiner installs before accepting
/// ordinary AppendEntries traffic (spec.md §4.6, §8): the responder's
/// `(current_term, last_applied)` plus the log entry at `last_applied`, if
/// it still has one in memory. `entry` is `None` only when the responder
/// itself has not applied anything yet.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointImage {
    pub term: Term,
    pub index: u64,
    pub master: NodeId,
    pub entry: Option<LogEntry>,
}

/// Traffic on the transport's separate control channel
/// (`control_input_socket`/`control_output_socket` in the original):
/// requesting and answering a [`CheckpointImage`] is kept off the regular
/// peer-RPC channel so a late joiner's bootstrap request never contends
/// with `RequestVote`/`AppendEntries` framing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CheckpointMsg {
    Request,
    Image(CheckpointImage),
}

/// Reply/request codes for `struct rpc` (spec.md §6).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcCode {
    ReqFn,
    ReqStatus,
    RepPending,
    RepComplete,
    RepInvTxid,
    RepInvSrv,
}

/// The Dispatcher-boundary RPC, `struct rpc` from spec.md §6.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rpc {
    pub code: RpcCode,
    pub client_id: u32,
    pub client_txid: u64,
    pub global_txid: u64,
    pub master: Option<NodeId>,
    pub payload: Vec<u8>,
}

impl Rpc {
    pub fn req_fn(client_id: u32, client_txid: u64, payload: Vec<u8>) -> Self {
        Rpc {
            code: RpcCode::ReqFn,
            client_id,
            client_txid,
            global_txid: 0,
            master: None,
            payload,
        }
    }

    pub fn req_status(client_id: u32, client_txid: u64) -> Self {
        Rpc {
            code: RpcCode::ReqStatus,
            client_id,
            client_txid,
            global_txid: 0,
            master: None,
            payload: Vec::new(),
        }
    }
}
