//! The core logic of a Raft node: terms, voting, log matching, commit
//! index, and apply (spec.md §4.2).

pub mod membership;
pub mod replication;

use std::collections::VecDeque;
use std::convert::TryInto;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;
use rand::Rng;

use crate::bridge::HostBridge;
use crate::dispatcher::LeaderView;
use crate::error::FatalError;
use crate::error::HostResult;
use crate::metrics::MetricsReporter;
use crate::metrics::RaftMetrics;
use crate::raft::membership::Membership;
use crate::raft::replication::LeaderState;
use crate::transport::Transport;
use crate::wire::AppendEntriesMsg;
use crate::wire::AppendEntriesResponseMsg;
use crate::wire::Envelope;
use crate::wire::EntryKind;
use crate::wire::LogEntry;
use crate::wire::Msg;
use crate::wire::RequestVoteMsg;
use crate::wire::RequestVoteResponseMsg;
use crate::LogId;
use crate::NodeId;
use crate::Term;

/// `RaftNodeState::role` from spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Election and request timing, mirroring `RAFT_ELECTION_TIMEOUT` /
/// `RAFT_REQUEST_TIMEOUT` from the original.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Election timeout is chosen uniformly from
    /// `[election_timeout_min, election_timeout_max)` on every reset, to
    /// avoid split-vote livelock.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// How often a leader sends AppendEntries (heartbeat) to each peer.
    pub request_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            request_timeout: Duration::from_millis(50),
        }
    }
}

/// A command enqueued to the Raft thread from the Dispatcher or an admin
/// caller, delivered over the in-process loopback (spec.md §5).
pub enum RaftCommand {
    Propose {
        payload: Vec<u8>,
        kind: EntryKind,
    },
    AddNonVoting(NodeId),
    Remove(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotLeaderError {
    pub leader: Option<NodeId>,
}

struct LogRecord {
    meta: LogEntry,
    payload_offset: u64,
}

/// The core type implementing the Raft protocol over a [`HostBridge`].
pub struct RaftCore<B: HostBridge> {
    id: NodeId,
    config: RaftConfig,
    bridge: Arc<B>,
    membership: Membership,

    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    current_leader: Option<NodeId>,

    /// In-memory mirror of the entries persisted via the bridge, used for
    /// log-matching and commit-index decisions without re-reading PLog.
    log: VecDeque<LogRecord>,
    /// Index of `log.front()`, i.e. the index of the oldest entry still
    /// in memory (1 if nothing has ever been polled).
    base_index: u64,

    commit_index: u64,
    last_applied: u64,

    votes_received: std::collections::BTreeSet<NodeId>,
    leader_state: Option<LeaderState>,

    last_heartbeat_seen: Instant,
    election_deadline: Instant,

    metrics: MetricsReporter,
    metrics_rx: Receiver<RaftMetrics>,
    leader_view: Arc<parking_lot::Mutex<LeaderView>>,

    /// Set while this node is a non-active late joiner still installing a
    /// checkpoint (spec.md §4.6); suppresses voting eligibility.
    image_building: bool,

    /// Latched by [`RaftCore::apply_committed`] when this node just applied
    /// its own committed `REMOVE`. Polled by the driving loop via
    /// [`RaftCore::take_fatal`] rather than threaded through every call
    /// site, since a self-removal can surface from `tick`, an inbound
    /// AppendEntries, or a local client proposal alike.
    pending_fatal: Option<FatalError>,
}

impl<B: HostBridge> RaftCore<B> {
    pub fn new(id: NodeId, config: RaftConfig, bridge: Arc<B>, leader_view: Arc<parking_lot::Mutex<LeaderView>>) -> Self {
        let (metrics, metrics_rx) = MetricsReporter::new(id);
        let now = Instant::now();
        RaftCore {
            id,
            election_deadline: now + Self::random_election_timeout(&config),
            config,
            bridge,
            membership: Membership::new_initial(id),
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            log: VecDeque::new(),
            base_index: 1,
            commit_index: 0,
            last_applied: 0,
            votes_received: Default::default(),
            leader_state: None,
            last_heartbeat_seen: now,
            metrics,
            metrics_rx,
            leader_view,
            image_building: false,
            pending_fatal: None,
        }
    }

    /// Takes and clears any latched fatal condition. The driving loop must
    /// call this after every [`RaftCore::tick`], [`RaftCore::handle_envelope`],
    /// or client-facing call and exit the process on `Some` (spec.md §6).
    pub fn take_fatal(&mut self) -> Option<FatalError> {
        self.pending_fatal.take()
    }

    fn random_election_timeout(config: &RaftConfig) -> Duration {
        let lo = config.election_timeout_min.as_millis() as u64;
        let hi = config.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(lo..hi.max(lo + 1)))
    }

    pub fn metrics_receiver(&self) -> Receiver<RaftMetrics> {
        self.metrics_rx.clone()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn set_image_building(&mut self, building: bool) {
        self.image_building = building;
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    fn last_log_id(&self) -> LogId {
        match self.log.back() {
            Some(r) => LogId {
                term: r.meta.term,
                index: r.meta.index,
            },
            None => LogId {
                term: 0,
                index: self.base_index.saturating_sub(1),
            },
        }
    }

    fn entry_at(&self, index: u64) -> Option<&LogRecord> {
        if index < self.base_index {
            return None;
        }
        self.log.get((index - self.base_index) as usize)
    }

    fn term_at(&self, index: u64) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry_at(index).map(|r| r.meta.term)
    }

    fn publish_metrics(&mut self) {
        self.metrics.publish(RaftMetrics {
            id: self.id,
            role: self.role,
            current_term: self.current_term,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
        });
        let mut view = self.leader_view.lock();
        view.role = self.role.into();
        view.leader = self.current_leader;
    }

    // ---- Replay (bootstrap only; never touches the bridge) ----

    /// Appends an already-persisted entry directly into the in-memory log,
    /// used only during recovery replay (spec.md §4.6) — the bridge's
    /// `offer_log_entry` must not be called here, or the entry would be
    /// persisted a second time.
    pub fn replay_entry(&mut self, entry: LogEntry, payload_offset: u64) {
        if entry.kind != EntryKind::User {
            self.membership.apply_offer(entry.kind, Self::target_of(&entry));
        }
        self.current_term = self.current_term.max(entry.term);
        self.log.push_back(LogRecord {
            meta: entry,
            payload_offset,
        });
    }

    pub fn reseat_persistent_state(&mut self, current_term: Term, voted_for: Option<NodeId>) {
        self.current_term = current_term;
        self.voted_for = voted_for;
    }

    /// This node's `(current_term, last_applied)` plus the log entry at
    /// `last_applied`, if one is still held in memory — the image handed to
    /// a late joiner's [`crate::bootstrap::ImageBuildClient`] request
    /// (spec.md §8).
    pub fn checkpoint_snapshot(&self) -> (Term, u64, Option<LogEntry>) {
        let entry = self.entry_at(self.last_applied).map(|r| r.meta.clone());
        (self.current_term, self.last_applied, entry)
    }

    /// Installs a late joiner's one-shot bootstrap image (spec.md §4.6, §8):
    /// durably re-appends the checkpoint entry via the bridge — mirroring
    /// `cyclone_deserialize_last_applied`'s header+payload re-append — and
    /// seeds it as this node's log start, so ordinary AppendEntries catch-up
    /// can build on top of it. Must run before this node accepts any
    /// AppendEntries or casts a vote.
    pub fn install_checkpoint(&mut self, term: Term, index: u64, entry: Option<LogEntry>) -> HostResult<()> {
        self.current_term = self.current_term.max(term);
        self.commit_index = self.commit_index.max(index);
        self.last_applied = self.last_applied.max(index);
        match entry {
            Some(entry) => {
                let offset = self.bridge.offer_log_entry(&entry)?;
                if entry.kind != EntryKind::User {
                    self.membership.apply_offer(entry.kind, Self::target_of(&entry));
                }
                self.base_index = entry.index;
                self.log.push_back(LogRecord {
                    meta: entry,
                    payload_offset: offset,
                });
            }
            None => self.base_index = index + 1,
        }
        Ok(())
    }

    fn target_of(entry: &LogEntry) -> NodeId {
        // Config-change entries carry the target node id as their payload,
        // little-endian encoded — see `client.rs::encode_config_target`.
        if entry.payload.len() >= 4 {
            u32::from_le_bytes(entry.payload[0..4].try_into().unwrap())
        } else {
            0
        }
    }

    // ---- Driving loop ----

    pub fn tick(&mut self) {
        let now = Instant::now();
        match self.role {
            Role::Leader => {
                self.send_append_entries_to_all();
                self.advance_commit_index();
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline && !self.image_building {
                    self.start_election();
                }
            }
        }
        self.publish_metrics();
    }

    pub fn handle_envelope(&mut self, envelope: Envelope) {
        let from = envelope.source;
        match envelope.msg {
            Msg::RequestVote(msg) => {
                let resp = self.handle_request_vote(msg);
                self.bridge.send_request_vote_response(from, resp);
            }
            Msg::RequestVoteResponse(msg) => self.handle_request_vote_response(from, msg),
            Msg::AppendEntries(msg) => {
                let resp = self.handle_append_entries(&msg, from);
                self.bridge.send_append_entries_response(from, resp);
            }
            Msg::AppendEntriesResponse(msg) => self.handle_append_entries_response(from, msg),
            _ => {}
        }
    }

    // ---- Elections ----

    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + Self::random_election_timeout(&self.config);
        self.last_heartbeat_seen = Instant::now();
    }

    /// Persists the follower transition before committing it to memory.
    /// Latches [`FatalError::PersistFailed`] and leaves role/term/vote
    /// untouched on failure (spec.md §4.3 item 3, §7: persistence failures
    /// are never silently swallowed).
    fn become_follower(&mut self, term: Term) {
        if let Err(e) = self.bridge.persist_term(term) {
            self.pending_fatal = Some(FatalError::PersistFailed(e.to_string()));
            return;
        }
        if let Err(e) = self.bridge.persist_vote(None) {
            self.pending_fatal = Some(FatalError::PersistFailed(e.to_string()));
            return;
        }
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.leader_state = None;
        self.reset_election_timer();
    }

    /// Persists the new term and self-vote before campaigning. On a
    /// persistence failure, latches [`FatalError::PersistFailed`] and does
    /// not start a candidacy that was never durably recorded.
    fn start_election(&mut self) {
        if !self.membership.is_voting(self.id) {
            self.reset_election_timer();
            return;
        }
        let new_term = self.current_term + 1;
        if let Err(e) = self.bridge.persist_term(new_term) {
            self.pending_fatal = Some(FatalError::PersistFailed(e.to_string()));
            return;
        }
        if let Err(e) = self.bridge.persist_vote(Some(self.id)) {
            self.pending_fatal = Some(FatalError::PersistFailed(e.to_string()));
            return;
        }
        self.role = Role::Candidate;
        self.current_term = new_term;
        self.voted_for = Some(self.id);
        self.votes_received = std::collections::BTreeSet::new();
        self.votes_received.insert(self.id);
        self.reset_election_timer();

        let last = self.last_log_id();
        if self.membership.quorum_size() == 1 {
            self.become_leader();
            return;
        }
        for peer in self.membership.voting.clone() {
            if peer == self.id {
                continue;
            }
            self.bridge.send_request_vote(
                peer,
                RequestVoteMsg {
                    term: self.current_term,
                    candidate_id: self.id,
                    last_log_index: last.index,
                    last_log_term: last.term,
                },
            );
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.current_leader = Some(self.id);
        let last_index = self.last_log_id().index;
        self.leader_state = Some(LeaderState::new(
            self.membership.all_members().filter(|&n| n != self.id),
            last_index,
        ));
        self.send_append_entries_to_all();
    }

    pub fn handle_request_vote(&mut self, msg: RequestVoteMsg) -> RequestVoteResponseMsg {
        if msg.term < self.current_term {
            return RequestVoteResponseMsg {
                term: self.current_term,
                vote_granted: false,
            };
        }
        if msg.term > self.current_term {
            self.become_follower(msg.term);
            if self.pending_fatal.is_some() {
                return RequestVoteResponseMsg {
                    term: self.current_term,
                    vote_granted: false,
                };
            }
        }
        let candidate_last = LogId {
            term: msg.last_log_term,
            index: msg.last_log_index,
        };
        let log_ok = candidate_last >= self.last_log_id();
        let can_vote = self.voted_for.is_none() || self.voted_for == Some(msg.candidate_id);
        if can_vote && log_ok {
            // Must not grant the vote until the ballot is durable: a crash
            // between granting and persisting could let this node vote
            // twice in the same term after restart.
            if let Err(e) = self.bridge.persist_vote(Some(msg.candidate_id)) {
                self.pending_fatal = Some(FatalError::PersistFailed(e.to_string()));
                return RequestVoteResponseMsg {
                    term: self.current_term,
                    vote_granted: false,
                };
            }
            self.voted_for = Some(msg.candidate_id);
            self.reset_election_timer();
            RequestVoteResponseMsg {
                term: self.current_term,
                vote_granted: true,
            }
        } else {
            RequestVoteResponseMsg {
                term: self.current_term,
                vote_granted: false,
            }
        }
    }

    pub fn handle_request_vote_response(&mut self, from: NodeId, msg: RequestVoteResponseMsg) {
        if self.role != Role::Candidate || msg.term != self.current_term {
            if msg.term > self.current_term {
                self.become_follower(msg.term);
            }
            return;
        }
        if msg.vote_granted {
            self.votes_received.insert(from);
            let have = self.votes_received.intersection(&self.membership.voting).count();
            if have >= self.membership.quorum_size() {
                self.become_leader();
            }
        }
    }

    // ---- Replication ----

    fn send_append_entries_to_all(&mut self) {
        let peers: Vec<NodeId> = self.membership.all_members().filter(|&n| n != self.id).collect();
        for peer in peers {
            self.send_append_entries_to(peer);
        }
    }

    fn send_append_entries_to(&mut self, peer: NodeId) {
        let Some(leader_state) = self.leader_state.as_ref() else { return };
        let next_index = leader_state
            .progress
            .get(&peer)
            .map(|p| p.next_index)
            .unwrap_or(self.base_index.max(1));
        let prev_index = next_index.saturating_sub(1);
        let prev_term = self.term_at(prev_index).unwrap_or(0);
        let entries: Vec<LogEntry> = self
            .log
            .iter()
            .skip_while(|r| r.meta.index < next_index)
            .map(|r| r.meta.clone())
            .collect();
        let msg = AppendEntriesMsg {
            term: self.current_term,
            prev_log_idx: prev_index,
            prev_log_term: prev_term,
            leader_commit: self.commit_index,
            entries,
        };
        let sent = self.bridge.send_append_entries(peer, &msg);
        let _ = sent;
    }

    fn handle_append_entries(&mut self, msg: &AppendEntriesMsg, from: NodeId) -> AppendEntriesResponseMsg {
        if msg.term < self.current_term {
            return AppendEntriesResponseMsg {
                term: self.current_term,
                success: false,
                match_index: 0,
            };
        }
        if msg.term > self.current_term || self.role != Role::Follower {
            self.become_follower(msg.term);
        }
        self.current_leader = Some(from);
        self.reset_election_timer();

        let prev_ok = match self.term_at(msg.prev_log_idx) {
            Some(t) => t == msg.prev_log_term,
            None => msg.prev_log_idx == 0,
        };
        if !prev_ok {
            return AppendEntriesResponseMsg {
                term: self.current_term,
                success: false,
                match_index: self.commit_index,
            };
        }

        let mut next_index = msg.prev_log_idx + 1;
        for entry in msg.entries.iter().cloned() {
            match self.term_at(next_index) {
                Some(existing_term) if existing_term == entry.term => {
                    // Already have it, matching term: skip.
                }
                Some(_) => {
                    self.truncate_conflicting_suffix(next_index);
                    self.append_entry_local(entry);
                }
                None => {
                    self.append_entry_local(entry);
                }
            }
            next_index += 1;
        }

        if msg.leader_commit > self.commit_index {
            let our_last = self.last_log_id().index;
            self.commit_index = msg.leader_commit.min(our_last);
            self.apply_committed();
        }

        AppendEntriesResponseMsg {
            term: self.current_term,
            success: true,
            match_index: self.last_log_id().index,
        }
    }

    fn truncate_conflicting_suffix(&mut self, from_index: u64) {
        while let Some(r) = self.log.back() {
            if r.meta.index < from_index {
                break;
            }
            let record = self.log.pop_back().unwrap();
            self.bridge.pop_log_entry(&record.meta, record.payload_offset);
            if record.meta.kind != EntryKind::User {
                self.membership.undo_offer(record.meta.kind, Self::target_of(&record.meta));
            }
        }
    }

    fn append_entry_local(&mut self, entry: LogEntry) {
        let offset = match self.bridge.offer_log_entry(&entry) {
            Ok(off) => off,
            Err(_) => return,
        };
        if entry.kind != EntryKind::User {
            let target = Self::target_of(&entry);
            self.membership.apply_offer(entry.kind, target);
            if let Some(leader_state) = self.leader_state.as_mut() {
                leader_state.ensure_tracked(target, entry.index.saturating_sub(1));
            }
        }
        self.log.push_back(LogRecord {
            meta: entry,
            payload_offset: offset,
        });
    }

    fn handle_append_entries_response(&mut self, from: NodeId, msg: AppendEntriesResponseMsg) {
        if msg.term > self.current_term {
            self.become_follower(msg.term);
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        let next_probe = self.entry_at(msg.match_index + 1).map(|_| msg.match_index + 2).unwrap_or(1);
        if let Some(leader_state) = self.leader_state.as_mut() {
            leader_state.on_append_response(from, msg.success, msg.match_index, next_probe);
        }
        self.advance_commit_index();
    }

    fn advance_commit_index(&mut self) {
        let Some(leader_state) = self.leader_state.as_ref() else { return };
        let self_last = self.last_log_id().index;
        let candidate = leader_state.majority_match_index(&self.membership, self.id, self_last);
        if candidate > self.commit_index && self.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    /// Applies every committed-but-not-yet-applied entry in order. Latches
    /// [`FatalError::RemovedSelf`] into `pending_fatal` rather than
    /// returning it: by the time a self-removal is discovered the node has
    /// already applied it and must keep running (it may still owe
    /// responses to in-flight peers) until the driving loop next polls
    /// [`RaftCore::take_fatal`] and exits the process.
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let Some(record) = self.entry_at(next) else { break };
            let meta = record.meta.clone();
            let offset = record.payload_offset;
            if let Err(e) = self.bridge.apply_log(&meta, offset) {
                self.pending_fatal = Some(FatalError::PersistFailed(e.to_string()));
                return;
            }
            if meta.kind == EntryKind::Remove {
                let target = Self::target_of(&meta);
                self.membership.apply_remove(target);
                if target == self.id {
                    self.last_applied = next;
                    self.pending_fatal = Some(FatalError::RemovedSelf);
                    return;
                }
            }
            self.last_applied = next;
        }
    }

    // ---- Client-facing operations ----

    pub fn client_propose(&mut self, payload: Vec<u8>, kind: EntryKind) -> Result<u64, NotLeaderError> {
        if self.role != Role::Leader {
            return Err(NotLeaderError { leader: self.current_leader });
        }
        let last_index = self.last_log_id().index;
        let entry = LogEntry {
            term: self.current_term,
            index: last_index + 1,
            kind,
            payload,
        };
        let index = entry.index;
        self.append_entry_local(entry);
        if self.membership.quorum_size() == 1 {
            self.advance_commit_index_for_single_node(index);
        } else {
            self.send_append_entries_to_all();
        }
        Ok(index)
    }

    fn advance_commit_index_for_single_node(&mut self, index: u64) {
        if self.membership.voting.len() == 1 && self.membership.is_voting(self.id) {
            self.commit_index = self.commit_index.max(index);
            self.apply_committed();
        }
    }

    pub fn add_nonvoting(&mut self, node: NodeId) -> Result<u64, NotLeaderError> {
        self.client_propose(crate::dispatcher::encode_config_target(node), EntryKind::AddNonVoting)
    }

    pub fn add_voting(&mut self, node: NodeId) -> Result<u64, NotLeaderError> {
        self.client_propose(crate::dispatcher::encode_config_target(node), EntryKind::AddVoting)
    }

    pub fn remove(&mut self, node: NodeId) -> Result<u64, NotLeaderError> {
        self.client_propose(crate::dispatcher::encode_config_target(node), EntryKind::Remove)
    }

    /// Called by the leader once a non-voting node's `match_index` catches
    /// up to the commit index at the time it was added (spec.md §4.2).
    pub fn promote_caught_up_nonvoters(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let Some(leader_state) = self.leader_state.as_ref() else { return };
        let caught_up: Vec<NodeId> = self
            .membership
            .non_voting
            .iter()
            .copied()
            .filter(|n| leader_state.progress.get(n).map(|p| p.match_index).unwrap_or(0) >= self.commit_index)
            .collect();
        for node in caught_up {
            let _ = self.add_voting(node);
        }
    }
}
