//! Tests for the lookup protocol: vocabulary, decomposition, and live
//! resolution between two wired endpoints.

use super::handlers;
use super::service::Lookup;
use super::types::{decompose, Classification, IterMode, LookupError, QueryResult};
use crate::config::RingConfig;
use crate::id::{IdFactory, Sha1Factory};
use crate::net::message::ops;
use crate::net::{spawn_workers, MessageSocket};
use crate::tables::RoutingTable;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============ Vocabulary ============

#[test]
fn iter_mode_round_trip() {
    for text in ["unsafe", "safe", "neighbor", "self", "no_neighbor", "no_safe"] {
        let mode = IterMode::parse(text).unwrap();
        assert_eq!(mode.as_str(), text);
    }
    assert!(IterMode::parse("bogus").is_none());
}

#[test]
fn compatibility_table_is_exact() {
    use Classification::SelfOwned;
    use IterMode::{NoNeighbor, NoSafe, Safe, SelfOnly, Unsafe};
    // (classification, mode) pairs permitted to answer locally.
    let answerable = [
        (SelfOwned, Unsafe),
        (SelfOwned, Safe),
        (SelfOwned, IterMode::Neighbor),
        (SelfOwned, SelfOnly),
        (SelfOwned, NoNeighbor),
        (SelfOwned, NoSafe),
        (Classification::Neighbor, Unsafe),
        (Classification::Neighbor, Safe),
        (Classification::Neighbor, IterMode::Neighbor),
        (Classification::Safe, Unsafe),
        (Classification::Safe, Safe),
        (Classification::Safe, NoNeighbor),
        (Classification::Unsafe, Unsafe),
        (Classification::Unsafe, NoNeighbor),
        (Classification::Unsafe, NoSafe),
    ];
    for class in [SelfOwned, Classification::Neighbor, Classification::Safe, Classification::Unsafe] {
        for mode in [Unsafe, Safe, IterMode::Neighbor, SelfOnly, NoNeighbor, NoSafe] {
            let expected = answerable.contains(&(class, mode));
            assert_eq!(
                class.answerable(mode),
                expected,
                "classification {class:?} with mode {mode:?}"
            );
        }
    }
}

// ============ Query decomposition ============

#[test]
fn decompose_compound_query() {
    let atoms = decompose("succ:0:1 pred:last finger:size").unwrap();
    let refs: Vec<(usize, usize, &str)> = atoms
        .iter()
        .map(|a| (a.query_id, a.op_id, a.reference.as_str()))
        .collect();
    assert_eq!(
        refs,
        vec![
            (0, 0, "succ:0"),
            (0, 1, "succ:1"),
            (1, 0, "pred:last"),
            (2, 0, "finger:size"),
        ]
    );
}

#[test]
fn decompose_rejects_malformed_groups() {
    assert!(decompose("succ").is_err(), "group without an op");
    assert!(decompose("succ:0 pred").is_err());
    assert!(decompose(":0").is_err(), "group without a table");
    assert!(decompose("succ::1").is_err(), "empty op");
    assert!(decompose("").unwrap().is_empty());
}

#[test]
fn query_result_line_round_trip() {
    let line = "2,1 succ:1 127.0.0.1:7001";
    let result = QueryResult::parse(line).unwrap();
    assert_eq!(result.query_id, 2);
    assert_eq!(result.op_id, 1);
    assert_eq!(result.reference, "succ:1");
    assert_eq!(result.value.as_deref(), Some("127.0.0.1:7001"));
    assert_eq!(result.encode(), line);

    let missing = QueryResult::parse("0,0 pred:0 not_found").unwrap();
    assert!(missing.value.is_none());

    assert!(QueryResult::parse("junk").is_none());
    assert!(QueryResult::parse("a,b succ:0 x").is_none());
    assert!(QueryResult::parse("0,0 succ:0 x trailing").is_none());
}

// ============ Live resolution ============

struct MiniNode {
    socket: Arc<MessageSocket>,
    table: Arc<RoutingTable>,
    lookup: Arc<Lookup>,
}

async fn mini_node(config: &Arc<RingConfig>) -> MiniNode {
    let factory: Arc<dyn IdFactory> = Arc::new(Sha1Factory);
    let socket = MessageSocket::bind("127.0.0.1:0", &*factory, config.clone())
        .await
        .unwrap();
    socket.start();
    let table = Arc::new(RoutingTable::new(socket.local().clone()));
    let lookup = Lookup::new(table.clone(), socket.clone(), factory, config.clone());
    let rx = socket.register(&[ops::INDEX, ops::TABLE]);
    let service = lookup.clone();
    spawn_workers("lookup", rx, 2, move |env| {
        let service = service.clone();
        async move { handlers::handle(service, env).await }
    });
    MiniNode {
        socket,
        table,
        lookup,
    }
}

fn test_config() -> Arc<RingConfig> {
    Arc::new(RingConfig {
        msg_timeout_ms: 300,
        lookup_timeout_ms: 1_500,
        ..RingConfig::default()
    })
}

/// Two nodes, each holding the other as both predecessor and successor.
async fn two_node_ring(config: &Arc<RingConfig>) -> (MiniNode, MiniNode) {
    let a = mini_node(config).await;
    let b = mini_node(config).await;
    for (this, other) in [(&a, &b), (&b, &a)] {
        this.table.preds().insert_sorted(other.socket.local().clone());
        this.table.succs().insert_sorted(other.socket.local().clone());
    }
    (a, b)
}

#[tokio::test]
async fn self_owned_lookup_answers_without_network() {
    let config = test_config();
    let (a, _b) = two_node_ring(&config).await;

    let started = Instant::now();
    let owner = a
        .lookup
        .lookup(a.socket.local().id(), IterMode::SelfOnly, None)
        .await
        .unwrap();
    assert!(a.table.is_self(&owner));
    // The fast path never waits on a reply.
    assert!(started.elapsed() < Duration::from_millis(config.msg_timeout_ms));
}

#[tokio::test]
async fn lookup_resolves_remote_owner() {
    let config = test_config();
    let (a, b) = two_node_ring(&config).await;

    let owner = a
        .lookup
        .lookup(b.socket.local().id(), IterMode::SelfOnly, None)
        .await
        .unwrap();
    assert_eq!(*owner, **b.socket.local());
}

#[tokio::test]
async fn lookup_times_out_against_a_dead_hint() {
    let config = test_config();
    let a = mini_node(&config).await;
    let dead = Arc::new(
        crate::net::NodeHandle::from_addr("127.0.0.1:1", &Sha1Factory).unwrap(),
    );

    let result = a
        .lookup
        .lookup(a.socket.local().id(), IterMode::SelfOnly, Some(dead))
        .await;
    assert!(matches!(result, Err(LookupError::Timeout)));
}

#[tokio::test]
async fn table_queries_resolve_references() {
    let config = test_config();
    let (a, b) = two_node_ring(&config).await;

    // Singular convenience call.
    let succ = a
        .lookup
        .lookup_table(b.socket.local(), "succ:0")
        .await
        .unwrap();
    assert_eq!(*succ, **a.socket.local());

    // Compound query with a size op and a miss.
    let results = a
        .lookup
        .lookup_tables(b.socket.local(), "succ:0 pred:size finger:0")
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].value.as_deref(), Some(a.socket.local().addr()).as_deref());
    assert_eq!(results[1].value.as_deref(), Some("1"));
    assert!(results[2].value.is_none(), "empty finger table is not_found");
}

#[tokio::test]
async fn lookup_table_rejects_compound_and_size_queries() {
    let config = test_config();
    let (a, b) = two_node_ring(&config).await;

    let compound = a.lookup.lookup_table(b.socket.local(), "succ:0:1").await;
    assert!(matches!(compound, Err(LookupError::InvalidArgument(_))));

    let size = a.lookup.lookup_table(b.socket.local(), "succ:size").await;
    assert!(matches!(size, Err(LookupError::InvalidArgument(_))));
}
