//! The gossip daemon: snapshot exchange with the immediate neighbors and
//! silence detection on the primary links.

use crate::config::RingConfig;
use crate::lookup::Lookup;
use crate::membership::Membership;
use crate::net::message::{ops, Message};
use crate::net::{Envelope, MessageSocket};
use crate::tables::{NeighborList, RoutingTable};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;

pub struct Gossip {
    table: Arc<RoutingTable>,
    lookup: Arc<Lookup>,
    socket: Arc<MessageSocket>,
    membership: Arc<Membership>,
    config: Arc<RingConfig>,
    /// Last merged snapshot version per (sender, list).
    seen: DashMap<(String, String), u64>,
    shutdown: Notify,
}

impl Gossip {
    pub fn new(
        table: Arc<RoutingTable>,
        lookup: Arc<Lookup>,
        socket: Arc<MessageSocket>,
        membership: Arc<Membership>,
        config: Arc<RingConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            lookup,
            socket,
            membership,
            config,
            seen: DashMap::new(),
            shutdown: Notify::new(),
        })
    }

    /// Spawns the gossip loop.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run().await;
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::debug!("Gossip stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.gossip_cycle()) => {}
            }
            self.broadcast().await;
            self.check_silence();
        }
    }

    /// Pushes the successor snapshot backward and the predecessor snapshot
    /// forward.
    pub async fn broadcast(&self) {
        if let Some(pred0) = self.table.preds().get(0) {
            if !self.table.is_self(&pred0) {
                let msg = self.snapshot_message(self.table.succs());
                if let Err(e) = self.socket.send(&pred0, &msg).await {
                    tracing::debug!("Gossip to {} failed: {}", pred0, e);
                }
            }
        }
        if let Some(succ0) = self.table.succs().get(0) {
            if !self.table.is_self(&succ0) {
                let msg = self.snapshot_message(self.table.preds());
                if let Err(e) = self.socket.send(&succ0, &msg).await {
                    tracing::debug!("Gossip to {} failed: {}", succ0, e);
                }
            }
        }
    }

    /// A primary neighbor silent past the leave timeout makes its list
    /// unstable; a silent successor additionally triggers the advisory
    /// leave check.
    pub fn check_silence(&self) {
        let succ0 = self.table.succs().get(0);
        let pred0 = self.table.preds().get(0);
        if let Some(succ0) = &succ0 {
            if succ0.age_ms() > self.config.gossip_leave_timeout_ms {
                tracing::warn!("Successor {} is silent", succ0);
                self.table.succs().set_stable(false);
                self.membership.check_leave(succ0.clone());
            }
        }
        if let Some(pred0) = &pred0 {
            if pred0.age_ms() > self.config.gossip_leave_timeout_ms {
                tracing::warn!("Predecessor {} is silent", pred0);
                self.table.preds().set_stable(false);
            }
        }
        // Dedup state follows the primary neighbors; a departed sender's
        // entries must not outlive it.
        self.seen.retain(|(sender, _), _| {
            succ0.as_ref().is_some_and(|s| s.addr() == *sender)
                || pred0.as_ref().is_some_and(|p| p.addr() == *sender)
        });
    }

    pub(crate) fn snapshot_message(&self, list: &NeighborList) -> Message {
        let mut body = format!(
            "--version {} --list {} --origin {}",
            list.version(),
            list.name(),
            self.table.me().addr()
        );
        for entry in list.snapshot() {
            body.push('\n');
            body.push_str(&entry.addr());
        }
        Message::request(ops::ALIVE, 0, body)
    }

    /// Merges one inbound snapshot. Only recognized immediate neighbors are
    /// heard; unchanged versions are dropped; the merge never reaches past
    /// what the local list already spans.
    pub async fn handle_alive(&self, env: Envelope) {
        let msg = env.msg;
        let Some(origin) = msg.option("origin") else {
            tracing::debug!("Dropping gossip without --origin");
            return;
        };
        let Some(sender) = self.table.find_handle(origin) else {
            tracing::debug!("Dropping gossip from unknown sender {}", origin);
            return;
        };
        let recognized = self
            .table
            .succs()
            .get(0)
            .is_some_and(|s| *s == *sender)
            || self.table.preds().get(0).is_some_and(|p| *p == *sender);
        if !recognized {
            tracing::debug!("Dropping gossip from non-neighbor {}", sender);
            return;
        }
        sender.touch();

        let list = match msg.option("list") {
            Some(name @ ("pred" | "succ")) => match self.table.list_by_name(name) {
                Some(list) => list,
                None => return,
            },
            _ => {
                tracing::debug!("Dropping gossip for an unmergeable list");
                return;
            }
        };
        let Some(version) = msg.option("version").and_then(|v| v.parse::<u64>().ok()) else {
            tracing::debug!("Dropping gossip without a version");
            return;
        };
        let key = (origin.to_string(), list.name().to_string());
        if let Some(previous) = self.seen.get(&key) {
            if *previous == version {
                return;
            }
        }
        self.seen.insert(key, version);

        // Bound the merge by what we already reach.
        let Some(boundary) = list.last() else {
            return;
        };
        let limit = list.distance(boundary.id());
        let mut incoming = Vec::new();
        for line in msg.body.lines().skip(1) {
            let addr = line.trim();
            if addr.is_empty() {
                continue;
            }
            let handle = match self.lookup.handle_for(addr) {
                Ok(h) => h,
                Err(e) => {
                    tracing::debug!("Skipping gossiped entry {addr:?}: {e}");
                    continue;
                }
            };
            if self.table.is_self(&handle) {
                continue;
            }
            if list.distance(handle.id()).compare(&limit) == Ordering::Greater {
                continue;
            }
            incoming.push(handle);
        }

        // Inside the snapshot's span, locals the neighbor no longer sees are
        // presumed gone. The sender and the primary entry are never pruned.
        if let Some(span) = incoming
            .iter()
            .map(|h| list.distance(h.id()))
            .max_by(|a, b| a.compare(b))
        {
            for (index, entry) in list.snapshot().iter().enumerate() {
                if index == 0 || **entry == *sender {
                    continue;
                }
                let d = list.distance(entry.id());
                if d.compare(&span) != Ordering::Greater
                    && !incoming.iter().any(|h| **h == **entry)
                {
                    tracing::info!("{}: pruning {} per {}'s view", list.name(), entry, sender);
                    list.remove(entry);
                    list.set_stable(false);
                }
            }
        }
        for handle in incoming {
            list.insert_sorted(handle);
        }
    }
}
