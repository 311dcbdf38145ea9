//! Process start-up: open (or create) the persistent log, replay it into a
//! fresh [`RaftCore`], fetch a late joiner's one-shot bootstrap image, wire
//! the [`DispatcherContext`] and [`StandardBridge`] together, and spin up
//! the driving thread.
//!
//! Grounded on `cyclone.cpp`'s `cyclone_boot`/`cyclone_deserialize_last_applied`
//! (the replay loop that reconstructs `raft_handle` state entry-by-entry
//! before the node starts accepting traffic), its `init_build_image`/
//! `raft_loaded_checkpoint` late-join path served over the
//! `control_input_socket`/`control_output_socket` pair (what
//! [`ImageBuildClient`] and the control-channel responder in [`drive`]
//! reimplement), and `dispatcher.cpp`'s `dispatcher_start` (pmem pool
//! open-or-create).

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver as MetricsReceiver;
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::config::CycloneConfig;
use crate::dispatcher::CommandExecutor;
use crate::dispatcher::DispatcherContext;
use crate::dispatcher::LeaderView;
use crate::error::FatalError;
use crate::metrics::RaftMetrics;
use crate::plog::CircularLog;
use crate::raft::RaftCommand;
use crate::raft::RaftConfig;
use crate::raft::RaftCore;
use crate::standard_bridge::decode_header;
use crate::standard_bridge::StandardBridge;
use crate::standard_bridge::ENTRY_HEADER_LEN;
use crate::transport::Transport;
use crate::wire::CheckpointImage;
use crate::wire::CheckpointMsg;
use crate::wire::LogEntry;
use crate::NodeId;

/// How long a late joiner waits for an active peer to answer its checkpoint
/// request before giving up and joining with only its local log.
const CHECKPOINT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Late-join checkpoint client (spec.md §8): requests the one-shot bootstrap
/// image from an active peer over the transport's control channel. A
/// separate trait rather than a method inlined into [`boot`] so a host can
/// substitute a different fetch strategy (e.g. trying every active replica
/// in turn) without touching `boot` itself.
pub trait ImageBuildClient {
    fn fetch_checkpoint(&self, from: NodeId, timeout: Duration) -> Option<CheckpointImage>;
}

impl<T: Transport> ImageBuildClient for StandardBridge<T> {
    fn fetch_checkpoint(&self, from: NodeId, timeout: Duration) -> Option<CheckpointImage> {
        self.control_send(from, CheckpointMsg::Request);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.control_recv(remaining) {
                Some((source, CheckpointMsg::Image(image))) if source == from => return Some(image),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

/// Everything [`boot`] hands back to the host process.
pub struct CycloneHandle {
    pub dispatcher: Arc<DispatcherContext>,
    pub metrics: MetricsReceiver<RaftMetrics>,
    pub raft_tx: Sender<RaftCommand>,
    driving_thread: JoinHandle<()>,
}

impl CycloneHandle {
    /// Blocks until the driving thread exits, which only happens after a
    /// [`crate::error::FatalError`] (spec.md §6) — a clean run never
    /// returns on its own.
    pub fn join(self) {
        let _ = self.driving_thread.join();
    }
}

/// Replays `plog`'s persisted entries into `core`, reseating
/// `current_term`/`voted_for` and feeding [`StandardBridge::note_replayed`]
/// so the ring's record-boundary bookkeeping matches what's actually on
/// disk, without re-appending anything (spec.md §4.6).
fn replay<T: Transport>(plog: &CircularLog, bridge: &StandardBridge<T>, core: &mut RaftCore<StandardBridge<T>>) {
    core.reseat_persistent_state(plog.current_term(), plog.voted_for());

    let mut cursor = plog.offset() - plog.len();
    let end = plog.offset();
    while cursor < end {
        let header = plog.read(cursor, ENTRY_HEADER_LEN);
        let (term, index, kind, payload_len, _crc) = decode_header(&header);
        cursor += ENTRY_HEADER_LEN as u64;
        let payload = plog.read(cursor, payload_len);
        let payload_offset = cursor;
        cursor += payload_len as u64;

        bridge.note_replayed(ENTRY_HEADER_LEN, payload_len);
        core.replay_entry(
            LogEntry {
                term,
                index,
                kind,
                payload,
            },
            payload_offset,
        );
    }
}

/// Opens or creates every on-disk resource this replica owns, replays its
/// log, and spawns the thread that drives [`RaftCore`] (spec.md §5: "one
/// long-running thread per replica"). Returns immediately; the driving
/// thread runs until a fatal error, at which point it exits the process
/// with a non-zero status (spec.md §6).
pub fn boot<T: Transport, E: CommandExecutor>(
    config: CycloneConfig,
    transport: Arc<T>,
    executor: Arc<E>,
) -> Result<CycloneHandle, FatalError> {
    let id: NodeId = config.me;
    let plog = Arc::new(CircularLog::open(&config.raft_log_path(), config.storage.logsize)?);

    let leader_view = Arc::new(Mutex::new(LeaderView::default()));
    let (raft_tx, raft_rx) = crossbeam_channel::unbounded();

    let dispatcher = Arc::new(
        DispatcherContext::open(
            id,
            std::path::Path::new(&config.dispatch.filepath),
            leader_view.clone(),
            raft_tx.clone(),
            executor,
        )
        .map_err(FatalError::Io)?,
    );

    let raft_config = RaftConfig::default();
    let bridge = Arc::new(StandardBridge::new(
        id,
        plog.clone(),
        raft_config.request_timeout,
        transport,
        dispatcher.clone(),
    ));

    let mut core = RaftCore::new(id, raft_config, bridge.clone(), leader_view.clone());
    if !config.is_active() {
        core.set_image_building(true);
    }
    replay(&plog, &bridge, &mut core);
    if !config.is_active() {
        // Late joiner: fetch the one-shot bootstrap image from the first
        // active replica before accepting any traffic (spec.md §4.6, §8).
        // Only the single last-applied entry is transferred, not a full
        // state-machine snapshot — that stays a non-goal (SPEC_FULL.md §14).
        match config.active.replicas.first().copied() {
            Some(master) => match bridge.fetch_checkpoint(master, CHECKPOINT_FETCH_TIMEOUT) {
                Some(image) => {
                    core.install_checkpoint(image.term, image.index, image.entry).map_err(|e| FatalError::PersistFailed(e.to_string()))?;
                }
                None => {
                    tracing::warn!(node = id, master, "no checkpoint image received within timeout; joining with only the local log");
                }
            },
            None => tracing::warn!(node = id, "no active replica configured to request a checkpoint from"),
        }
        core.set_image_building(false);
    }

    let metrics = core.metrics_receiver();

    let driving_thread = thread::Builder::new()
        .name(format!("cyclone-raft-{}", id))
        .spawn(move || drive(core, bridge, raft_rx))
        .map_err(FatalError::Io)?;

    Ok(CycloneHandle {
        dispatcher,
        metrics,
        raft_tx,
        driving_thread,
    })
}

/// The per-replica event loop: deliver inbound peer traffic, apply locally
/// queued commands, and tick the election/heartbeat clock. Exits the
/// process on the first fatal condition (spec.md §6, exit code -1),
/// including a voluntary self-`REMOVE`.
fn drive<T: Transport>(mut core: RaftCore<StandardBridge<T>>, bridge: Arc<StandardBridge<T>>, raft_rx: crossbeam_channel::Receiver<RaftCommand>) {
    const POLL_INTERVAL: Duration = Duration::from_millis(20);
    loop {
        if let Some(envelope) = bridge.transport_recv(POLL_INTERVAL) {
            core.handle_envelope(envelope);
        } else {
            core.tick();
        }

        // Answer any late joiner's checkpoint request with this node's own
        // (term, last_applied) image (spec.md §8). Non-blocking: a request
        // here never delays the replication/election work above.
        if let Some((from, CheckpointMsg::Request)) = bridge.control_recv(Duration::from_secs(0)) {
            let (term, index, entry) = core.checkpoint_snapshot();
            bridge.control_send(
                from,
                CheckpointMsg::Image(CheckpointImage {
                    term,
                    index,
                    master: bridge.id(),
                    entry,
                }),
            );
        }

        while let Ok(command) = raft_rx.try_recv() {
            match command {
                RaftCommand::Propose { payload, kind } => {
                    let _ = core.client_propose(payload, kind);
                }
                RaftCommand::AddNonVoting(node) => {
                    let _ = core.add_nonvoting(node);
                }
                RaftCommand::Remove(node) => {
                    let _ = core.remove(node);
                }
            }
            if let Some(fatal) = core.take_fatal() {
                tracing::error!(error = %fatal, "fatal condition, exiting");
                std::process::exit(-1);
            }
        }
        core.promote_caught_up_nonvoters();

        if let Some(fatal) = core.take_fatal() {
            tracing::error!(error = %fatal, "fatal condition, exiting");
            std::process::exit(-1);
        }
    }
}
