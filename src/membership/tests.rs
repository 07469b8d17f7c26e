//! Tests for the membership protocol: outcome vocabulary, side guards, and
//! live join/leave handshakes between wired endpoints.

use super::handlers;
use super::service::Membership;
use super::types::{
    payload_option, AbortReason, AckKind, ClaimOutcome, Op, Outcome, SideGuard,
};
use crate::config::RingConfig;
use crate::id::{IdFactory, Sha1Factory};
use crate::lookup::handlers as lookup_handlers;
use crate::lookup::Lookup;
use crate::net::message::{ops, Message};
use crate::net::{spawn_workers, MessageSocket, NodeHandle};
use crate::tables::RoutingTable;
use std::sync::Arc;
use std::time::Duration;

// ============ Outcome vocabulary ============

#[test]
fn outcome_reply_targets_the_request_conversation() {
    let request = Message::request(ops::JOIN, 7, "--host 10.0.0.1:7000");
    let reply = Outcome::ack(AckKind::Confirm).to_reply(&request, 9);
    assert_eq!(reply.to_ticket, 7);
    assert_eq!(reply.from_ticket, 9);
    assert_eq!(reply.operation, ops::ACK);
}

#[test]
fn outcome_wire_round_trip() {
    let request = Message::request(ops::JOIN, 7, "");

    let confirm = Outcome::Ack(AckKind::Confirm, "--succ 10.0.0.2:7000".into());
    let msg = Message::parse(&confirm.to_reply(&request, 9).encode()).unwrap();
    assert_eq!(msg.option("msg"), Some("confirm"));
    assert_eq!(msg.option("succ"), Some("10.0.0.2:7000"));
    assert!(matches!(
        Outcome::from_message(&msg),
        Some(Outcome::Ack(AckKind::Confirm, _))
    ));

    let abort = Outcome::Abort(
        AbortReason::ConcurrentConflict,
        "--mypred 10.0.0.3:7000".into(),
    );
    let msg = Message::parse(&abort.to_reply(&request, 9).encode()).unwrap();
    assert_eq!(msg.option("reason"), Some("concurrent_conflict"));
    match Outcome::from_message(&msg) {
        Some(Outcome::Abort(AbortReason::ConcurrentConflict, payload)) => {
            assert_eq!(payload_option(&payload, "mypred"), Some("10.0.0.3:7000"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let msg = Message::parse(&Outcome::Commit(String::new()).to_reply(&request, 9).encode())
        .unwrap();
    assert!(matches!(
        Outcome::from_message(&msg),
        Some(Outcome::Commit(_))
    ));
}

#[test]
fn unknown_kinds_do_not_parse() {
    let mut msg = Message::request(ops::ACK, 1, "--msg nonsense");
    assert!(Outcome::from_message(&msg).is_none());
    msg.operation = ops::ABORT.to_string();
    msg.body = "--reason nonsense".to_string();
    assert!(Outcome::from_message(&msg).is_none());
    msg.operation = ops::READY.to_string();
    assert!(Outcome::from_message(&msg).is_none());
}

// ============ Side guards ============

#[test]
fn side_guard_admits_one_transaction_per_side() {
    let guard = SideGuard::new("succ");
    let claim = guard.try_claim("10.0.0.1:7000", Op::Join);
    assert!(matches!(claim, ClaimOutcome::Acquired(_)));
    assert!(matches!(
        guard.try_claim("10.0.0.1:7000", Op::Join),
        ClaimOutcome::AlreadyInitiated
    ));
    assert!(matches!(
        guard.try_claim("10.0.0.2:7000", Op::Join),
        ClaimOutcome::Busy
    ));
    assert!(matches!(
        guard.try_claim("10.0.0.1:7000", Op::Leave),
        ClaimOutcome::Busy
    ));
    drop(claim);
    assert!(matches!(
        guard.try_claim("10.0.0.2:7000", Op::Leave),
        ClaimOutcome::Acquired(_)
    ));
}

// ============ Live handshakes ============

struct TestNode {
    socket: Arc<MessageSocket>,
    table: Arc<RoutingTable>,
    membership: Arc<Membership>,
}

async fn ring_node(config: &Arc<RingConfig>) -> TestNode {
    let factory: Arc<dyn IdFactory> = Arc::new(Sha1Factory);
    let socket = MessageSocket::bind("127.0.0.1:0", &*factory, config.clone())
        .await
        .unwrap();
    socket.start();
    let table = Arc::new(RoutingTable::new(socket.local().clone()));
    let lookup = Lookup::new(table.clone(), socket.clone(), factory, config.clone());
    let membership = Membership::new(
        table.clone(),
        lookup.clone(),
        socket.clone(),
        config.clone(),
    );

    let rx = socket.register(&[ops::INDEX, ops::TABLE]);
    let service = lookup.clone();
    spawn_workers("lookup", rx, 2, move |env| {
        let service = service.clone();
        async move { lookup_handlers::handle(service, env).await }
    });
    let rx = socket.register(&[ops::JOIN, ops::JOIN_PRED, ops::LEAVE, ops::LEAVE_PRED]);
    let service = membership.clone();
    spawn_workers("membership", rx, 2, move |env| {
        let service = service.clone();
        async move { handlers::handle(service, env).await }
    });

    TestNode {
        socket,
        table,
        membership,
    }
}

fn test_config() -> Arc<RingConfig> {
    Arc::new(RingConfig {
        msg_timeout_ms: 200,
        connect_msg_timeout_ms: 200,
        lookup_timeout_ms: 1_500,
        joinpred_timeout_ms: 1_500,
        connect_timeout_ms: 5_000,
        ..RingConfig::default()
    })
}

fn local(node: &TestNode) -> Arc<NodeHandle> {
    node.socket.local().clone()
}

/// Every node's first successor must link straight back to it.
fn assert_ring_consistent(nodes: &[&TestNode]) {
    for node in nodes {
        let succ0 = node
            .table
            .succs()
            .get(0)
            .unwrap_or_else(|| panic!("{} has no successor", node.socket.local()));
        let next = nodes
            .iter()
            .find(|n| n.socket.local().addr() == succ0.addr())
            .unwrap_or_else(|| panic!("successor {} is not a ring node", succ0));
        let back = next.table.preds().get(0).expect("successor has no predecessor");
        assert_eq!(
            back.addr(),
            node.socket.local().addr(),
            "{} -> {} does not link back",
            node.socket.local(),
            succ0
        );
    }
}

#[tokio::test]
async fn two_node_bootstrap_links_both_directions() {
    let config = test_config();
    let a = ring_node(&config).await;
    let b = ring_node(&config).await;

    b.membership.connect(local(&a)).await.unwrap();

    assert_eq!(a.table.succs().get(0).unwrap().addr(), local(&b).addr());
    assert_eq!(a.table.preds().get(0).unwrap().addr(), local(&b).addr());
    assert_eq!(b.table.succs().get(0).unwrap().addr(), local(&a).addr());
    assert_eq!(b.table.preds().get(0).unwrap().addr(), local(&a).addr());
}

#[tokio::test]
async fn rejoining_an_existing_member_is_idempotent() {
    let config = test_config();
    let a = ring_node(&config).await;
    let b = ring_node(&config).await;

    b.membership.connect(local(&a)).await.unwrap();
    b.membership.connect(local(&a)).await.unwrap();

    assert_eq!(b.table.preds().len(), 1);
    assert_eq!(b.table.succs().len(), 1);
    assert_ring_consistent(&[&a, &b]);
}

#[tokio::test]
async fn third_join_runs_the_delegate_handshake() {
    let config = test_config();
    let a = ring_node(&config).await;
    let b = ring_node(&config).await;
    let c = ring_node(&config).await;

    b.membership.connect(local(&a)).await.unwrap();
    c.membership.connect(local(&a)).await.unwrap();

    assert_ring_consistent(&[&a, &b, &c]);
}

#[tokio::test]
async fn disconnect_clears_tables_and_heals_the_ring() {
    let config = test_config();
    let a = ring_node(&config).await;
    let b = ring_node(&config).await;
    let c = ring_node(&config).await;

    b.membership.connect(local(&a)).await.unwrap();
    c.membership.connect(local(&a)).await.unwrap();

    assert!(c.membership.disconnect().await);

    assert!(c.table.preds().is_empty());
    assert!(c.table.succs().is_empty());
    assert!(c.table.fingers().is_empty());
    let gone = local(&c);
    assert!(!a.table.contains(&gone));
    assert!(!b.table.contains(&gone));
    assert_ring_consistent(&[&a, &b]);
}

#[tokio::test]
async fn connect_against_a_silent_peer_fails_without_partial_links() {
    let config = Arc::new(RingConfig {
        msg_timeout_ms: 150,
        connect_msg_timeout_ms: 150,
        lookup_timeout_ms: 600,
        connect_timeout_ms: 1_200,
        ..RingConfig::default()
    });
    let a = ring_node(&config).await;
    // A socket that receives but never answers.
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let hint = Arc::new(
        NodeHandle::from_addr(&silent.local_addr().unwrap().to_string(), &Sha1Factory).unwrap(),
    );

    let result = a.membership.connect(hint).await;
    assert!(result.is_err(), "join against silence must surface an error");
    assert!(a.table.preds().is_empty());
    assert!(a.table.succs().is_empty());
}

#[tokio::test]
async fn join_commit_timeout_rolls_back_installed_links() {
    let config = Arc::new(RingConfig {
        msg_timeout_ms: 150,
        connect_msg_timeout_ms: 150,
        lookup_timeout_ms: 600,
        connect_timeout_ms: 1_200,
        ..RingConfig::default()
    });
    let joiner = ring_node(&config).await;

    // A peer that answers index and table queries and admits the join, but
    // never acknowledges the commit.
    let factory: Arc<dyn IdFactory> = Arc::new(Sha1Factory);
    let socket = MessageSocket::bind("127.0.0.1:0", &*factory, config.clone())
        .await
        .unwrap();
    socket.start();
    let table = Arc::new(RoutingTable::new(socket.local().clone()));
    let lookup = Lookup::new(table, socket.clone(), factory, config.clone());
    let rx = socket.register(&[ops::INDEX, ops::TABLE]);
    spawn_workers("lookup", rx, 2, move |env| {
        let service = lookup.clone();
        async move { lookup_handlers::handle(service, env).await }
    });
    let mut rx = socket.register(&[ops::JOIN]);
    let peer = socket.clone();
    tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            let me = peer.local().addr();
            let Ok(ticket) = peer.request_ticket() else {
                return;
            };
            let confirm =
                Outcome::Ack(AckKind::Confirm, format!("--host {me} --succ {me}"));
            let _ = peer.send_addr(env.from, &confirm.to_reply(&env.msg, ticket.id())).await;
            // The ticket drops here, so the joiner's commit lands nowhere.
        }
    });

    let result = joiner.membership.connect(socket.local().clone()).await;
    assert!(result.is_err(), "an unacknowledged commit must fail the join");
    assert!(joiner.table.preds().is_empty());
    assert!(joiner.table.succs().is_empty());
}

#[tokio::test]
async fn join_pred_at_a_bare_node_is_refused() {
    let config = test_config();
    let a = ring_node(&config).await;
    let b = ring_node(&config).await;
    let b_handle = local(&b);

    let mut ticket = a.socket.request_ticket().unwrap();
    let request = Message::request(
        ops::JOIN_PRED,
        ticket.id(),
        format!("--host {} --origin {}", local(&a).addr(), local(&a).addr()),
    );
    a.socket.send(&b_handle, &request).await.unwrap();

    let reply = ticket
        .receive(Some(&b_handle), Duration::from_secs(2))
        .await
        .expect("the bare node must answer");
    assert!(matches!(
        Outcome::from_message(&reply),
        Some(Outcome::Abort(AbortReason::Internal, _))
    ));
    assert!(b.table.preds().is_empty());
}
