//! End-to-end cluster behavior driven over [`LoopbackTransport`]: dynamic
//! membership growth from a single node, client command replication and
//! exactly-once apply, misrouted/duplicate request handling, and failover.
//!
//! Each test drives every node's [`RaftCore`] from this thread in a tight
//! tick/deliver loop rather than spawning `bootstrap::drive` threads, so
//! assertions don't race real timers beyond the small sleeps needed to let
//! `RaftConfig`'s election/heartbeat deadlines actually elapse.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use cyclone::dispatcher::CommandExecutor;
use cyclone::dispatcher::DispatcherContext;
use cyclone::dispatcher::LeaderView;
use cyclone::plog::CircularLog;
use cyclone::raft::RaftCommand;
use cyclone::raft::RaftConfig;
use cyclone::raft::RaftCore;
use cyclone::raft::Role;
use cyclone::standard_bridge::StandardBridge;
use cyclone::transport::LoopbackTransport;
use cyclone::wire::RpcCode;
use cyclone::NodeId;

struct Echo;
impl CommandExecutor for Echo {
    fn execute(&self, _client_id: u32, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

struct Node {
    core: RaftCore<StandardBridge<LoopbackTransport>>,
    bridge: Arc<StandardBridge<LoopbackTransport>>,
    dispatcher: Arc<DispatcherContext>,
    raft_rx: crossbeam_channel::Receiver<RaftCommand>,
    _dir: tempfile::TempDir,
}

fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(20),
        election_timeout_max: Duration::from_millis(40),
        request_timeout: Duration::from_millis(10),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn build_cluster(ids: &[NodeId]) -> HashMap<NodeId, Node> {
    init_tracing();
    let mut transports = LoopbackTransport::cluster(ids);
    let mut nodes = HashMap::new();
    for &id in ids {
        let dir = tempfile::tempdir().unwrap();
        let plog = Arc::new(CircularLog::open(&dir.path().join("plog.bin"), 1 << 16).unwrap());
        let leader_view = Arc::new(parking_lot::Mutex::new(LeaderView::default()));
        let (raft_tx, raft_rx) = crossbeam_channel::unbounded();
        let dispatcher = Arc::new(
            DispatcherContext::open(id, &dir.path().join("disp.bin"), leader_view.clone(), raft_tx, Arc::new(Echo)).unwrap(),
        );
        let transport = Arc::new(transports.remove(&id).unwrap());
        let bridge = Arc::new(StandardBridge::new(id, plog, test_config().request_timeout, transport, dispatcher.clone()));
        let core = RaftCore::new(id, test_config(), bridge.clone(), leader_view);
        nodes.insert(
            id,
            Node {
                core,
                bridge,
                dispatcher,
                raft_rx,
                _dir: dir,
            },
        );
    }
    nodes
}

/// Drains a node's locally-queued [`RaftCommand`]s (from its own dispatcher
/// or a direct test-issued proposal) into its `RaftCore`.
fn drain_commands(node: &mut Node) {
    while let Ok(cmd) = node.raft_rx.try_recv() {
        match cmd {
            RaftCommand::Propose { payload, kind } => {
                let _ = node.core.client_propose(payload, kind);
            }
            RaftCommand::AddNonVoting(n) => {
                let _ = node.core.add_nonvoting(n);
            }
            RaftCommand::Remove(n) => {
                let _ = node.core.remove(n);
            }
        }
    }
}

fn deliver_all(nodes: &mut HashMap<NodeId, Node>) {
    loop {
        let mut delivered = false;
        let ids: Vec<NodeId> = nodes.keys().copied().collect();
        for id in ids {
            let envelope = nodes.get(&id).unwrap().bridge.transport_recv(Duration::from_millis(0));
            if let Some(envelope) = envelope {
                nodes.get_mut(&id).unwrap().core.handle_envelope(envelope);
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
    }
}

/// Ticks every live node, drains its commands, and delivers in-flight
/// traffic, repeatedly, for `duration` of wall-clock time.
fn run_for(nodes: &mut HashMap<NodeId, Node>, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        let ids: Vec<NodeId> = nodes.keys().copied().collect();
        for id in ids {
            let node = nodes.get_mut(&id).unwrap();
            node.core.tick();
            drain_commands(node);
            node.core.promote_caught_up_nonvoters();
        }
        deliver_all(nodes);
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn leader_id(nodes: &HashMap<NodeId, Node>) -> Option<NodeId> {
    nodes.iter().find(|(_, n)| n.core.role() == Role::Leader).map(|(&id, _)| id)
}

/// Grows a single-node cluster into a voting set of `ids.len()` by having
/// the sole initial leader `add_voting` every other id in turn, running the
/// cluster long enough after each addition for the change to replicate.
fn bootstrap_cluster(ids: &[NodeId]) -> HashMap<NodeId, Node> {
    let mut nodes = build_cluster(ids);
    run_for(&mut nodes, Duration::from_millis(100));
    let leader = leader_id(&nodes).expect("sole node must self-elect");
    for &id in ids {
        if id == leader {
            continue;
        }
        nodes.get_mut(&leader).unwrap().core.add_voting(id).unwrap();
        run_for(&mut nodes, Duration::from_millis(150));
    }
    nodes
}

#[test]
fn single_node_self_elects_and_commits_without_peers() {
    let mut nodes = build_cluster(&[0]);
    run_for(&mut nodes, Duration::from_millis(100));
    assert_eq!(nodes[&0].core.role(), Role::Leader);

    let rpc = nodes[&0].dispatcher.handle_req_fn(1, 1, b"hello".to_vec());
    assert_eq!(rpc.code, RpcCode::RepPending);
    drain_commands(nodes.get_mut(&0).unwrap());
    run_for(&mut nodes, Duration::from_millis(20));

    let status = nodes[&0].dispatcher.handle_req_status(1, 1);
    assert_eq!(status.code, RpcCode::RepComplete);
    assert_eq!(status.payload, b"hello");
}

#[test]
fn three_node_cluster_elects_a_leader_and_replicates_membership() {
    let nodes = bootstrap_cluster(&[0, 1, 2]);
    for (&id, node) in nodes.iter() {
        assert_eq!(node.core.membership().voting.len(), 3, "node {} missing peers", id);
    }
    assert_eq!(leader_id(&nodes), Some(0));
}

#[test]
fn client_write_replicates_and_applies_on_every_follower() {
    let mut nodes = bootstrap_cluster(&[0, 1, 2]);
    let leader = leader_id(&nodes).unwrap();

    let rpc = nodes[&leader].dispatcher.handle_req_fn(7, 1, b"set x=1".to_vec());
    assert_eq!(rpc.code, RpcCode::RepPending);
    drain_commands(nodes.get_mut(&leader).unwrap());
    run_for(&mut nodes, Duration::from_millis(100));

    for node in nodes.values() {
        let status = node.dispatcher.handle_req_status(7, 1);
        assert_eq!(status.code, RpcCode::RepComplete, "node did not apply the committed entry");
        assert_eq!(status.payload, b"set x=1");
    }
}

#[test]
fn duplicate_client_txid_is_rejected_without_reproposing() {
    let mut nodes = bootstrap_cluster(&[0, 1, 2]);
    let leader = leader_id(&nodes).unwrap();

    nodes[&leader].dispatcher.handle_req_fn(3, 1, b"first".to_vec());
    drain_commands(nodes.get_mut(&leader).unwrap());
    run_for(&mut nodes, Duration::from_millis(100));

    let retry = nodes[&leader].dispatcher.handle_req_fn(3, 1, b"first".to_vec());
    assert_eq!(retry.code, RpcCode::RepInvTxid);
    assert_eq!(retry.client_txid, 1, "must report the already-committed txid, not 0");
}

#[test]
fn non_leader_rejects_with_leader_hint() {
    let nodes = bootstrap_cluster(&[0, 1, 2]);
    let leader = leader_id(&nodes).unwrap();
    let follower = *nodes.keys().find(|&&id| id != leader).unwrap();

    let rpc = nodes[&follower].dispatcher.handle_req_fn(1, 1, b"hi".to_vec());
    assert_eq!(rpc.code, RpcCode::RepInvSrv);
    assert_eq!(rpc.master, Some(leader), "a follower must hint the actual leader");
}

#[test]
fn leader_failover_elects_a_new_leader_and_keeps_committing() {
    let mut nodes = bootstrap_cluster(&[0, 1, 2]);
    let old_leader = leader_id(&nodes).unwrap();

    nodes[&old_leader].dispatcher.handle_req_fn(1, 1, b"before-failover".to_vec());
    drain_commands(nodes.get_mut(&old_leader).unwrap());
    run_for(&mut nodes, Duration::from_millis(100));

    nodes.remove(&old_leader);
    run_for(&mut nodes, Duration::from_millis(300));

    let new_leader = leader_id(&nodes).expect("remaining majority must elect a new leader");
    assert_ne!(new_leader, old_leader);

    let rpc = nodes[&new_leader].dispatcher.handle_req_fn(1, 2, b"after-failover".to_vec());
    assert_eq!(rpc.code, RpcCode::RepPending);
    drain_commands(nodes.get_mut(&new_leader).unwrap());
    run_for(&mut nodes, Duration::from_millis(100));

    for node in nodes.values() {
        let status = node.dispatcher.handle_req_status(1, 2);
        assert_eq!(status.code, RpcCode::RepComplete);
    }
}
