//! The UDP message socket.
//!
//! One socket per node. A background receive loop parses inbound datagrams
//! and routes them either into a conversation ticket (replies,
//! `to_ticket != 0`) or to the named service registered for the operation
//! (unsolicited messages). Service queues are bounded; a full queue drops the
//! message rather than growing without bound under flood.
//!
//! Conversation tickets are a bounded namespace of 255 concurrently
//! outstanding request/reply exchanges; exhaustion fails the initiating
//! operation immediately.

use super::message::{ops, Message, FLAG_PING, FLAG_PONG};
use super::types::{split_addr, NodeHandle};
use crate::config::RingConfig;
use crate::id::IdFactory;
use anyhow::{anyhow, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant;

/// An inbound message together with its sender endpoint.
#[derive(Debug)]
pub struct Envelope {
    pub from: SocketAddr,
    pub msg: Message,
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("no free conversation tickets")]
    Exhausted,
}

/// A blocking receive ran out of time without a matching reply.
#[derive(Debug, Error)]
#[error("timed out waiting for a reply")]
pub struct RecvTimeout;

type TicketTable = Arc<DashMap<u8, mpsc::UnboundedSender<Envelope>>>;

/// An allocated conversation slot. Replies addressed to this ticket queue up
/// here; dropping the ticket releases the slot and discards stale queued
/// replies.
pub struct Ticket {
    id: u8,
    rx: mpsc::UnboundedReceiver<Envelope>,
    table: TicketTable,
}

impl Ticket {
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Next queued reply, optionally filtered by sender. Non-matching
    /// messages are discarded. Fails with `RecvTimeout` once the deadline
    /// passes.
    pub async fn receive(
        &mut self,
        from: Option<&NodeHandle>,
        timeout: Duration,
    ) -> Result<Message, RecvTimeout> {
        Ok(self.receive_envelope(from, timeout).await?.msg)
    }

    /// Like `receive`, keeping the sender endpoint.
    pub async fn receive_envelope(
        &mut self,
        from: Option<&NodeHandle>,
        timeout: Duration,
    ) -> Result<Envelope, RecvTimeout> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(RecvTimeout)?;
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(env)) => {
                    if let Some(expected) = from {
                        if expected.addr() != env.from.to_string() {
                            tracing::debug!(
                                "Ticket {}: dropping reply from unexpected sender {}",
                                self.id,
                                env.from
                            );
                            continue;
                        }
                        expected.touch();
                    }
                    return Ok(env);
                }
                Ok(None) | Err(_) => return Err(RecvTimeout),
            }
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// The node's datagram endpoint.
pub struct MessageSocket {
    socket: Arc<UdpSocket>,
    local: Arc<NodeHandle>,
    local_addr: SocketAddr,
    config: Arc<RingConfig>,
    tickets: TicketTable,
    services: DashMap<String, mpsc::Sender<Envelope>>,
    shutdown: Notify,
}

impl MessageSocket {
    /// Binds a UDP socket on `bind` (`"host:port"`, port 0 for ephemeral)
    /// and derives the local node handle by hashing the canonical bound
    /// address.
    pub async fn bind(
        bind: &str,
        factory: &dyn IdFactory,
        config: Arc<RingConfig>,
    ) -> Result<Arc<Self>> {
        let (host, _) = split_addr(bind)?;
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| anyhow!("binding {bind}: {e}"))?;
        let local_addr = socket.local_addr()?;
        let canonical = format!("{}:{}", host, local_addr.port());
        let id = factory.hash(canonical.as_bytes());
        let local = Arc::new(NodeHandle::new(host, local_addr.port(), id));
        tracing::info!("Message socket bound on {} (id {})", canonical, local.id());
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local,
            local_addr,
            config,
            tickets: Arc::new(DashMap::new()),
            services: DashMap::new(),
            shutdown: Notify::new(),
        }))
    }

    pub fn local(&self) -> &Arc<NodeHandle> {
        &self.local
    }

    /// Registers a service queue for the given unsolicited operations and
    /// returns its receiving end. The queue is bounded by
    /// `service_queue_depth`.
    pub fn register(&self, operations: &[&str]) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.config.service_queue_depth.max(1));
        for op in operations {
            self.services.insert((*op).to_string(), tx.clone());
        }
        rx
    }

    /// Allocates a free conversation ticket (1..=255), scanning from a random
    /// offset so slots wear evenly.
    pub fn request_ticket(&self) -> Result<Ticket, TicketError> {
        let start: u16 = rand::thread_rng().gen_range(0..255);
        for i in 0..255u16 {
            let id = ((start + i) % 255 + 1) as u8;
            if let Entry::Vacant(slot) = self.tickets.entry(id) {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(tx);
                return Ok(Ticket {
                    id,
                    rx,
                    table: self.tickets.clone(),
                });
            }
        }
        Err(TicketError::Exhausted)
    }

    /// Fire-and-forget send. Loops back locally addressed messages without
    /// touching the wire.
    pub async fn send(&self, to: &NodeHandle, msg: &Message) -> Result<()> {
        if *to == *self.local {
            self.dispatch(self.local_addr, msg.clone());
            return Ok(());
        }
        let encoded = msg.encode();
        if encoded.len() > self.config.max_packet_size {
            return Err(anyhow!(
                "message {} exceeds max packet size ({} > {})",
                msg,
                encoded.len(),
                self.config.max_packet_size
            ));
        }
        self.socket
            .send_to(encoded.as_bytes(), (to.host(), to.port()))
            .await
            .map_err(|e| anyhow!("sending {} to {}: {e}", msg, to))?;
        Ok(())
    }

    /// Send to a raw endpoint (used for replies to whatever endpoint a
    /// request arrived from).
    pub async fn send_addr(&self, to: SocketAddr, msg: &Message) -> Result<()> {
        if to == self.local_addr {
            self.dispatch(self.local_addr, msg.clone());
            return Ok(());
        }
        let encoded = msg.encode();
        if encoded.len() > self.config.max_packet_size {
            return Err(anyhow!(
                "message {} exceeds max packet size ({} > {})",
                msg,
                encoded.len(),
                self.config.max_packet_size
            ));
        }
        self.socket
            .send_to(encoded.as_bytes(), to)
            .await
            .map_err(|e| anyhow!("sending {} to {}: {e}", msg, to))?;
        Ok(())
    }

    /// Unreliable round-trip probe. Returns the measured round-trip time of
    /// the first answered attempt, or `None` after `tries` unanswered ones.
    pub async fn ping(
        &self,
        to: &NodeHandle,
        timeout: Duration,
        tries: u32,
    ) -> Option<Duration> {
        let mut ticket = match self.request_ticket() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Ping to {} failed: {}", to, e);
                return None;
            }
        };
        for _ in 0..tries.max(1) {
            let started = Instant::now();
            let msg = Message {
                from_ticket: ticket.id(),
                to_ticket: 0,
                flags: FLAG_PING,
                operation: ops::PING.to_string(),
                body: String::new(),
            };
            if let Err(e) = self.send(to, &msg).await {
                tracing::debug!("Ping send to {} failed: {}", to, e);
                continue;
            }
            match ticket.receive(Some(to), timeout).await {
                Ok(reply) if reply.is_pong() => return Some(started.elapsed()),
                Ok(other) => {
                    tracing::debug!("Ping to {} got non-pong reply {}", to, other);
                }
                Err(RecvTimeout) => {}
            }
        }
        None
    }

    /// Spawns the background receive loop.
    pub fn start(self: &Arc<Self>) {
        let socket = self.clone();
        tokio::spawn(async move {
            socket.run().await;
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; self.config.max_packet_size];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("Message socket {} shutting down", self.local);
                    break;
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(ok) => ok,
                        Err(e) => {
                            tracing::warn!("Socket receive error: {}", e);
                            continue;
                        }
                    };
                    let text = match std::str::from_utf8(&buf[..len]) {
                        Ok(t) => t,
                        Err(_) => {
                            tracing::warn!("Dropping non-UTF8 datagram from {}", from);
                            continue;
                        }
                    };
                    match Message::parse(text) {
                        Ok(msg) => self.dispatch(from, msg),
                        Err(e) => {
                            tracing::warn!("Dropping malformed message from {}: {}", from, e);
                        }
                    }
                }
            }
        }
    }

    /// Routes one inbound message: probe answering, then ticket delivery,
    /// then named-service dispatch. Undeliverable messages are dropped.
    fn dispatch(&self, from: SocketAddr, msg: Message) {
        if msg.is_ping() {
            let pong = Message {
                from_ticket: 0,
                to_ticket: msg.from_ticket,
                flags: FLAG_PONG,
                operation: ops::PONG.to_string(),
                body: String::new(),
            };
            let socket = self.socket.clone();
            tokio::spawn(async move {
                if let Err(e) = socket.send_to(pong.encode().as_bytes(), from).await {
                    tracing::debug!("Pong to {} failed: {}", from, e);
                }
            });
            return;
        }
        if msg.to_ticket != 0 {
            match self.tickets.get(&msg.to_ticket) {
                Some(tx) => {
                    if tx.send(Envelope { from, msg }).is_err() {
                        tracing::debug!("Reply for a released ticket dropped");
                    }
                }
                None => {
                    tracing::debug!("Dropping {} for unknown ticket from {}", msg, from);
                }
            }
            return;
        }
        match self.services.get(&msg.operation) {
            Some(tx) => {
                if let Err(e) = tx.try_send(Envelope { from, msg }) {
                    tracing::warn!("Service queue rejected message from {}: {}", from, e);
                }
            }
            None => {
                tracing::debug!("Dropping {} with no registered service, from {}", msg, from);
            }
        }
    }
}

/// Runs a service's handler over its queue with at most `workers` concurrent
/// handler tasks. Backpressure lives at the bounded queue; the semaphore
/// bounds in-flight work.
pub fn spawn_workers<F, Fut>(
    name: &'static str,
    mut rx: mpsc::Receiver<Envelope>,
    workers: usize,
    handler: F,
) where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!("Service {} started with {} workers", name, workers);
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let handler = Arc::new(handler);
        while let Some(env) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                handler(env).await;
                drop(permit);
            });
        }
        tracing::debug!("Service {} queue closed", name);
    });
}
