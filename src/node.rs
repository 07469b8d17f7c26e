//! The node facade: wires the socket, the routing table, and the four
//! protocol services together, and exposes the public ring API.

use crate::config::RingConfig;
use crate::gossip::{self, Gossip};
use crate::id::{Id, IdFactory, Sha1Factory};
use crate::lookup::{self, Lookup, LookupError};
use crate::membership::{self, Membership};
use crate::net::message::ops;
use crate::net::{spawn_workers, MessageSocket, NodeHandle};
use crate::stabilizer::Stabilizer;
use crate::tables::RoutingTable;
use anyhow::Result;
use std::sync::Arc;

pub struct RingNode {
    factory: Arc<dyn IdFactory>,
    socket: Arc<MessageSocket>,
    table: Arc<RoutingTable>,
    lookup: Arc<Lookup>,
    membership: Arc<Membership>,
    stabilizer: Arc<Stabilizer>,
    gossip: Arc<Gossip>,
}

impl RingNode {
    /// Binds the node, registers the protocol services, and starts the
    /// maintenance daemons. The node comes up alone; `connect` joins it to
    /// an existing ring.
    pub async fn start(bind: &str, config: Arc<RingConfig>) -> Result<Arc<Self>> {
        let factory: Arc<dyn IdFactory> = Arc::new(Sha1Factory);
        let socket = MessageSocket::bind(bind, &*factory, config.clone()).await?;
        socket.start();
        let table = Arc::new(RoutingTable::new(socket.local().clone()));
        let lookup = Lookup::new(table.clone(), socket.clone(), factory.clone(), config.clone());
        let membership = Membership::new(
            table.clone(),
            lookup.clone(),
            socket.clone(),
            config.clone(),
        );
        let stabilizer = Stabilizer::new(
            table.clone(),
            lookup.clone(),
            socket.clone(),
            factory.clone(),
            config.clone(),
        );
        let gossip = Gossip::new(
            table.clone(),
            lookup.clone(),
            socket.clone(),
            membership.clone(),
            config.clone(),
        );

        let workers = config.service_worker_count.max(1);
        let rx = socket.register(&[ops::INDEX, ops::TABLE]);
        let service = lookup.clone();
        spawn_workers("lookup", rx, workers, move |env| {
            let service = service.clone();
            async move { lookup::handlers::handle(service, env).await }
        });
        let rx = socket.register(&[ops::JOIN, ops::JOIN_PRED, ops::LEAVE, ops::LEAVE_PRED]);
        let service = membership.clone();
        spawn_workers("membership", rx, workers, move |env| {
            let service = service.clone();
            async move { membership::handlers::handle(service, env).await }
        });
        let rx = socket.register(&[ops::ALIVE]);
        let service = gossip.clone();
        spawn_workers("gossip", rx, workers, move |env| {
            let service = service.clone();
            async move { gossip::handlers::handle(service, env).await }
        });

        stabilizer.start();
        gossip.start();
        tracing::info!("Node {} up at {}", socket.local().id(), socket.local());

        Ok(Arc::new(Self {
            factory,
            socket,
            table,
            lookup,
            membership,
            stabilizer,
            gossip,
        }))
    }

    /// This node's own handle.
    pub fn local(&self) -> &Arc<NodeHandle> {
        self.socket.local()
    }

    /// Hashes an application key into the ring's identifier space.
    pub fn id_of(&self, key: &[u8]) -> Id {
        self.factory.hash(key)
    }

    /// Joins the ring reachable through `seed`.
    pub async fn connect(&self, seed: &str) -> Result<()> {
        let hint = self.lookup.handle_for(seed)?;
        self.membership.connect(hint).await
    }

    /// Leaves the ring and clears the local tables.
    pub async fn disconnect(&self) -> bool {
        self.membership.disconnect().await
    }

    /// Resolves the node responsible for `id` across the ring.
    pub async fn lookup(&self, id: &Id) -> Result<Arc<NodeHandle>, LookupError> {
        self.lookup.lookup(id, self.lookup.default_mode(), None).await
    }

    /// Best local guess of the node responsible for `id`.
    pub fn owner_of(&self, id: &Id) -> Arc<NodeHandle> {
        self.table.owner_of(id)
    }

    /// Resolves a local `"table:index"` reference.
    pub fn resolve_reference(&self, reference: &str) -> Option<Arc<NodeHandle>> {
        self.table.resolve_reference(reference)
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Whether all three neighbor containers are currently marked stable.
    pub fn is_stable(&self) -> bool {
        self.table.is_stable()
    }

    /// Stops the daemons and the socket loop. Call `disconnect` first for a
    /// clean departure.
    pub fn shutdown(&self) {
        self.gossip.shutdown();
        self.stabilizer.shutdown();
        self.socket.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::RingNode;
    use crate::config::RingConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> Arc<RingConfig> {
        Arc::new(RingConfig {
            msg_timeout_ms: 200,
            connect_msg_timeout_ms: 200,
            lookup_timeout_ms: 1_500,
            joinpred_timeout_ms: 1_500,
            connect_timeout_ms: 5_000,
            concurrent_cycle_ms: 200,
            backoff_cycle_ms: 600,
            gossip_cycle_ms: 200,
            ..RingConfig::default()
        })
    }

    #[tokio::test]
    async fn nodes_form_a_ring_and_resolve_lookups() {
        let config = test_config();
        let a = RingNode::start("127.0.0.1:0", config.clone()).await.unwrap();
        let b = RingNode::start("127.0.0.1:0", config).await.unwrap();

        b.connect(&a.local().addr()).await.unwrap();

        let owner = b.lookup(a.local().id()).await.unwrap();
        assert_eq!(owner.addr(), a.local().addr());

        // The stabilizer settles both nodes.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(a.is_stable());
        assert!(b.is_stable());

        assert!(b.disconnect().await);
        b.shutdown();
        a.shutdown();
    }
}
