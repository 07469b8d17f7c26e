//! Tests for the stabilizer: sizing policy, the balance test, and live
//! rebalance rounds over wired rings.

use super::service::{finger_count, neighbor_count, Balance, Stabilizer};
use crate::config::RingConfig;
use crate::id::{Id, IdFactory, Sha1Factory};
use crate::lookup::handlers as lookup_handlers;
use crate::lookup::Lookup;
use crate::net::message::ops;
use crate::net::{spawn_workers, MessageSocket, NodeHandle};
use crate::tables::stabilize::{stabilize_liveness, stabilize_repair};
use crate::tables::{Direction, NeighborList, RoutingTable};
use std::sync::Arc;
use std::time::Duration;

// ============ Sizing policy ============

fn sizing_config(min_succ: usize, succ_ratio: f64) -> RingConfig {
    RingConfig {
        min_succ,
        succ_ratio,
        ..RingConfig::default()
    }
}

#[test]
fn split_follows_the_ratio_beyond_the_minimum() {
    let config = sizing_config(3, 0.5);
    assert_eq!(neighbor_count(7, &config), 5);
    assert_eq!(finger_count(7, &config), 2);
}

#[test]
fn split_identities_hold() {
    let config = sizing_config(3, 0.5);
    let mut previous_fc = 0;
    for n in 0..=32 {
        let nc = neighbor_count(n, &config);
        let fc = finger_count(n, &config);
        assert_eq!(nc + fc, n, "split must partition n={n}");
        if n <= config.min_succ {
            assert_eq!(nc, n, "small rings are all neighbors (n={n})");
        }
        assert!(fc >= previous_fc, "finger share never shrinks (n={n})");
        previous_fc = fc;
    }
}

#[test]
fn ratio_extremes() {
    let all_neighbors = sizing_config(3, 1.0);
    assert_eq!(neighbor_count(10, &all_neighbors), 10);
    assert_eq!(finger_count(10, &all_neighbors), 0);

    let minimum_only = sizing_config(3, 0.0);
    assert_eq!(neighbor_count(10, &minimum_only), 3);
    assert_eq!(finger_count(10, &minimum_only), 7);
}

// ============ Live rebalance ============

struct TestNode {
    socket: Arc<MessageSocket>,
    table: Arc<RoutingTable>,
    lookup: Arc<Lookup>,
    stabilizer: Arc<Stabilizer>,
}

async fn ring_node(config: &Arc<RingConfig>) -> TestNode {
    let factory: Arc<dyn IdFactory> = Arc::new(Sha1Factory);
    let socket = MessageSocket::bind("127.0.0.1:0", &*factory, config.clone())
        .await
        .unwrap();
    socket.start();
    let table = Arc::new(RoutingTable::new(socket.local().clone()));
    let lookup = Lookup::new(table.clone(), socket.clone(), factory.clone(), config.clone());
    let stabilizer = Stabilizer::new(
        table.clone(),
        lookup.clone(),
        socket.clone(),
        factory,
        config.clone(),
    );
    let rx = socket.register(&[ops::INDEX, ops::TABLE]);
    let service = lookup.clone();
    spawn_workers("lookup", rx, 2, move |env| {
        let service = service.clone();
        async move { lookup_handlers::handle(service, env).await }
    });
    TestNode {
        socket,
        table,
        lookup,
        stabilizer,
    }
}

fn test_config() -> Arc<RingConfig> {
    Arc::new(RingConfig {
        msg_timeout_ms: 200,
        lookup_timeout_ms: 1_000,
        ..RingConfig::default()
    })
}

/// Wires `nodes` into a ring ordered by identifier: each node starts with
/// exactly its immediate successor and predecessor.
fn wire_ring(nodes: &mut Vec<TestNode>) {
    nodes.sort_by(|a, b| a.socket.local().id().cmp(b.socket.local().id()));
    let count = nodes.len();
    for i in 0..count {
        let next = nodes[(i + 1) % count].socket.local().clone();
        let prev = nodes[(i + count - 1) % count].socket.local().clone();
        nodes[i].table.succs().insert_sorted(next);
        nodes[i].table.preds().insert_sorted(prev);
    }
}

#[tokio::test]
async fn alone_rebalance_is_stable() {
    let config = test_config();
    let node = ring_node(&config).await;
    node.stabilizer.rebalance().await;
    assert!(node.table.is_stable());
    assert!(node.table.succs().is_empty());
}

#[tokio::test]
async fn one_sided_state_is_broken() {
    let config = test_config();
    let node = ring_node(&config).await;
    let peer = Arc::new(NodeHandle::from_addr("127.0.0.1:9", &Sha1Factory).unwrap());
    node.table.succs().insert_sorted(peer);
    node.stabilizer.rebalance().await;
    assert!(!node.table.is_stable());
}

#[tokio::test]
async fn two_node_ring_settles_at_one_entry() {
    let config = test_config();
    let mut nodes = vec![ring_node(&config).await, ring_node(&config).await];
    wire_ring(&mut nodes);
    nodes[0].stabilizer.rebalance().await;
    assert!(nodes[0].table.is_stable());
    assert_eq!(nodes[0].table.succs().len(), 1);
    assert_eq!(nodes[0].table.preds().len(), 1);
}

#[tokio::test]
async fn four_node_ring_grows_until_the_span_closes() {
    let config = test_config();
    let mut nodes = Vec::new();
    for _ in 0..4 {
        nodes.push(ring_node(&config).await);
    }
    wire_ring(&mut nodes);

    // With a single successor the covered span leaves a gap.
    assert_eq!(nodes[0].stabilizer.balance_test(1).await, Balance::Grow);

    nodes[0].stabilizer.rebalance().await;
    assert!(nodes[0].table.is_stable());
    assert_eq!(nodes[0].table.succs().len(), 2);
    assert_eq!(nodes[0].table.preds().len(), 2);
}

// ============ Structural repair ============

fn repair_config() -> Arc<RingConfig> {
    Arc::new(RingConfig {
        msg_timeout_ms: 200,
        lookup_timeout_ms: 500,
        min_succ: 1,
        ..RingConfig::default()
    })
}

/// Nodes in ring order; the first one serves as the list owner, so the rest
/// follow it at increasing distance.
async fn sorted_nodes(config: &Arc<RingConfig>, count: usize) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for _ in 0..count {
        nodes.push(ring_node(config).await);
    }
    nodes.sort_by(|a, b| a.socket.local().id().cmp(b.socket.local().id()));
    nodes
}

fn handle(node: &TestNode) -> Arc<NodeHandle> {
    node.socket.local().clone()
}

#[tokio::test]
async fn repair_inserts_the_entry_a_chain_gap_reveals() {
    let config = repair_config();
    let nodes = sorted_nodes(&config, 4).await;
    let (me, a, b, c) = (&nodes[0], &nodes[1], &nodes[2], &nodes[3]);

    // We know a and c; a's own chain knows about b in between.
    me.table.succs().insert_sorted(handle(a));
    me.table.succs().insert_sorted(handle(c));
    a.table.succs().insert_sorted(handle(b));
    b.table.succs().insert_sorted(handle(c));

    stabilize_repair(me.table.succs(), &me.lookup, &config).await;

    assert_eq!(me.table.succs().len(), 3);
    assert!(me.table.succs().contains(&handle(b)));
}

#[tokio::test]
async fn repair_evicts_an_entry_the_chain_bypasses() {
    let config = repair_config();
    let nodes = sorted_nodes(&config, 4).await;
    let (me, a, x, c) = (&nodes[0], &nodes[1], &nodes[2], &nodes[3]);

    // a's chain goes straight to c, so x is no longer a member.
    me.table.succs().insert_sorted(handle(a));
    me.table.succs().insert_sorted(handle(x));
    a.table.succs().insert_sorted(handle(c));

    stabilize_repair(me.table.succs(), &me.lookup, &config).await;

    assert!(!me.table.succs().contains(&handle(x)));
    assert!(me.table.succs().contains(&handle(a)));
    assert!(!me.table.succs().stable());
}

#[tokio::test]
async fn repair_crops_entries_past_the_ring_wrap() {
    let config = repair_config();
    let nodes = sorted_nodes(&config, 3).await;
    let (me, a, stale) = (&nodes[0], &nodes[1], &nodes[2]);

    // a's chain wraps back to the owner; everything past a is redundant.
    me.table.succs().insert_sorted(handle(a));
    me.table.succs().insert_sorted(handle(stale));
    a.table.succs().insert_sorted(handle(me));

    stabilize_repair(me.table.succs(), &me.lookup, &config).await;

    assert_eq!(me.table.succs().len(), 1);
    assert!(me.table.succs().contains(&handle(a)));
}

#[tokio::test]
async fn repair_evicts_an_unresponsive_boundary() {
    let config = repair_config();
    let nodes = sorted_nodes(&config, 2).await;
    let (me, live) = (&nodes[0], &nodes[1]);
    // Just past the owner, so it sorts before any real node.
    let dead = Arc::new(NodeHandle::new(
        "127.0.0.1",
        1,
        me.socket.local().id().add(&Id::from_bytes(&[1])),
    ));

    me.table.succs().insert_sorted(dead.clone());
    me.table.succs().insert_sorted(handle(live));

    stabilize_repair(me.table.succs(), &me.lookup, &config).await;

    assert!(!me.table.succs().contains(&dead));
    assert!(me.table.succs().contains(&handle(live)));
    assert!(!me.table.succs().stable());
}

// ============ Liveness sweep ============

#[tokio::test]
async fn liveness_sweep_evicts_the_silent_tail() {
    let config = Arc::new(RingConfig {
        alive_timeout_ms: 0,
        ping_timeout_ms: 150,
        ping_retry_count: 1,
        ..RingConfig::default()
    });
    let prober = ring_node(&config).await;
    let live_peer = ring_node(&config).await;

    let list = NeighborList::new("succ", Direction::Ascending, Id::zero(2));
    let near = Arc::new(NodeHandle::new(
        "127.0.0.1",
        live_peer.socket.local().port(),
        Id::from_bytes(&[0x20, 0x00]),
    ));
    let dead = Arc::new(NodeHandle::new(
        "127.0.0.1",
        1,
        Id::from_bytes(&[0x40, 0x00]),
    ));
    list.insert_sorted(near.clone());
    list.insert_sorted(dead.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;

    stabilize_liveness(&list, &prober.socket, &config).await;
    assert_eq!(list.len(), 1, "the dead tail is evicted");
    assert!(list.contains(&near));

    // A quiet follow-up sweep leaves the list stable.
    tokio::time::sleep(Duration::from_millis(30)).await;
    stabilize_liveness(&list, &prober.socket, &config).await;
    assert!(list.stable());
}
