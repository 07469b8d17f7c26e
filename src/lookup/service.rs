//! The lookup engine: client state machine and server-side resolution.

use super::types::{decompose, AtomicQuery, Classification, IterMode, LookupError, QueryResult};
use crate::config::RingConfig;
use crate::id::{Id, IdFactory};
use crate::net::message::{ops, Message};
use crate::net::{Envelope, MessageSocket, NodeHandle};
use crate::tables::RoutingTable;
use std::sync::Arc;
use tokio::time::Instant;

pub struct Lookup {
    table: Arc<RoutingTable>,
    socket: Arc<MessageSocket>,
    factory: Arc<dyn IdFactory>,
    config: Arc<RingConfig>,
}

impl Lookup {
    pub fn new(
        table: Arc<RoutingTable>,
        socket: Arc<MessageSocket>,
        factory: Arc<dyn IdFactory>,
        config: Arc<RingConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            socket,
            factory,
            config,
        })
    }

    /// Iteration mode used when the caller (or an inbound query) names none.
    pub fn default_mode(&self) -> IterMode {
        IterMode::parse(&self.config.lookup_iter_mode).unwrap_or(IterMode::NoSafe)
    }

    /// Canonical shared handle for a wire address: reuses the instance any
    /// local table already holds, so contact timestamps stay shared.
    pub fn handle_for(&self, addr: &str) -> Result<Arc<NodeHandle>, LookupError> {
        if let Some(known) = self.table.find_handle(addr) {
            known.touch();
            return Ok(known);
        }
        NodeHandle::from_addr(addr, &*self.factory)
            .map(Arc::new)
            .map_err(|e| LookupError::InvalidArgument(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    /// Resolves the node responsible for `id`.
    ///
    /// With no hint, an identifier the local table says we own ourselves is
    /// answered immediately without touching the network. Otherwise a
    /// candidate stack is worked through: forwarding pointers returned by
    /// non-authoritative nodes are pushed and tried next; timeouts pop the
    /// failed candidate, falling back to the local best guess (or the
    /// original hint) when the stack drains. Bounded by the overall lookup
    /// deadline.
    pub async fn lookup(
        &self,
        id: &Id,
        mode: IterMode,
        hint: Option<Arc<NodeHandle>>,
    ) -> Result<Arc<NodeHandle>, LookupError> {
        let local_owner = self.table.owner_of(id);
        if hint.is_none() && self.table.is_self(&local_owner) {
            return Ok(local_owner);
        }
        let original = hint.unwrap_or(local_owner);
        let mut ticket = self
            .socket
            .request_ticket()
            .map_err(|_| LookupError::Exhausted)?;
        let mut stack: Vec<Arc<NodeHandle>> = vec![original.clone()];
        let deadline = Instant::now() + self.config.lookup_timeout();
        let body = format!(
            "--index {} --origin {} --iter {}",
            id.to_base64(),
            self.socket.local().addr(),
            mode.as_str()
        );

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(LookupError::Timeout),
            };
            let target = match stack.last() {
                Some(t) => t.clone(),
                None => {
                    // Stack drained: fall back to the current local guess,
                    // or the original candidate when that guess is ourselves.
                    let guess = self.table.owner_of(id);
                    let fallback = if self.table.is_self(&guess) {
                        original.clone()
                    } else {
                        guess
                    };
                    stack.push(fallback.clone());
                    fallback
                }
            };
            let msg = Message::request(ops::INDEX, ticket.id(), body.clone());
            if let Err(e) = self.socket.send(&target, &msg).await {
                tracing::debug!("Lookup send to {} failed: {}", target, e);
                stack.pop();
                continue;
            }
            let wait = remaining.min(self.config.msg_timeout());
            match ticket.receive(None, wait).await {
                Ok(reply) if reply.operation == ops::INDEX_RES => {
                    let mut fields = reply.body.split_whitespace();
                    let (reply_id, owner_addr, class) =
                        match (fields.next(), fields.next(), fields.next()) {
                            (Some(i), Some(a), Some(c)) => (i, a, c),
                            _ => {
                                tracing::debug!("Dropping malformed lookup reply from {}", target);
                                continue;
                            }
                        };
                    if reply_id != id.to_base64() {
                        tracing::debug!("Dropping lookup reply for a different identifier");
                        continue;
                    }
                    let owner = match self.handle_for(owner_addr) {
                        Ok(o) => o,
                        Err(e) => {
                            tracing::debug!("Dropping lookup reply with bad owner: {}", e);
                            continue;
                        }
                    };
                    owner.touch();
                    if Classification::parse(class) == Some(Classification::SelfOwned) {
                        return Ok(owner);
                    }
                    // Forwarding pointer: try it next, unless it would cycle.
                    if stack.iter().any(|h| **h == *owner) {
                        stack.pop();
                    } else {
                        stack.push(owner);
                    }
                }
                Ok(other) => {
                    tracing::debug!("Ignoring unexpected {} during lookup", other);
                }
                Err(_) => {
                    stack.pop();
                }
            }
        }
    }

    /// Sends a compound table query to `ask` and reassembles the ordered
    /// result list.
    pub async fn lookup_tables(
        &self,
        ask: &NodeHandle,
        query: &str,
    ) -> Result<Vec<QueryResult>, LookupError> {
        let atoms = decompose(query)?;
        if atoms.is_empty() {
            return Err(LookupError::InvalidArgument("empty table query".into()));
        }
        let mut ticket = self
            .socket
            .request_ticket()
            .map_err(|_| LookupError::Exhausted)?;
        let deadline = Instant::now() + self.config.lookup_timeout();
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(LookupError::Timeout),
            };
            let msg = Message::request(ops::TABLE, ticket.id(), query);
            self.socket
                .send(ask, &msg)
                .await
                .map_err(|e| LookupError::InvalidArgument(e.to_string()))?;
            let wait = remaining.min(self.config.msg_timeout());
            match ticket.receive(Some(ask), wait).await {
                Ok(reply) if reply.operation == ops::TABLE_RES => {
                    let mut results: Vec<QueryResult> =
                        reply.body.lines().filter_map(QueryResult::parse).collect();
                    results.sort_by_key(|r| (r.query_id, r.op_id));
                    return Ok(results);
                }
                Ok(other) => {
                    tracing::debug!("Ignoring unexpected {} during table query", other);
                }
                Err(_) => {}
            }
        }
    }

    /// Single-reference convenience call: exactly one atomic query, no size
    /// queries, and an empty result counts as no answer.
    pub async fn lookup_table(
        &self,
        ask: &NodeHandle,
        reference: &str,
    ) -> Result<Arc<NodeHandle>, LookupError> {
        let atoms = decompose(reference)?;
        if atoms.len() != 1 {
            return Err(LookupError::InvalidArgument(format!(
                "expected one atomic query, got {reference:?}"
            )));
        }
        if atoms[0].reference.ends_with(":size") {
            return Err(LookupError::InvalidArgument(
                "size queries have no handle result".into(),
            ));
        }
        let results = self.lookup_tables(ask, reference).await?;
        match results.into_iter().next().and_then(|r| r.value) {
            Some(value) => self.handle_for(&value),
            None => Err(LookupError::Timeout),
        }
    }

    // ------------------------------------------------------------------
    // Server side
    // ------------------------------------------------------------------

    fn classify(&self, owner: &NodeHandle) -> Classification {
        if self.table.is_self(owner) {
            Classification::SelfOwned
        } else if self.table.preds().get(0).is_some_and(|p| *p == *owner)
            || self.table.succs().get(0).is_some_and(|s| *s == *owner)
        {
            Classification::Neighbor
        } else if self.table.is_safe(owner) {
            Classification::Safe
        } else {
            Classification::Unsafe
        }
    }

    /// Serves one inbound index query: answer toward the origin when the
    /// iteration mode permits our classification, otherwise forward the
    /// query unchanged to the better owner.
    pub async fn handle_index(&self, env: Envelope) {
        let msg = env.msg;
        let id = match msg.option("index").map(|i| self.factory.decode(i)) {
            Some(Ok(id)) => id,
            Some(Err(e)) => {
                tracing::warn!("Dropping index query with bad identifier: {}", e);
                return;
            }
            None => {
                tracing::warn!("Dropping index query without --index");
                return;
            }
        };
        let origin = match msg.option("origin").map(|o| self.handle_for(o)) {
            Some(Ok(o)) => o,
            _ => {
                tracing::warn!("Dropping index query without a valid --origin");
                return;
            }
        };
        let mode = msg
            .option("iter")
            .and_then(IterMode::parse)
            .unwrap_or_else(|| self.default_mode());

        let owner = self.table.owner_of(&id);
        let class = self.classify(&owner);
        if class.answerable(mode) {
            let reply = Message {
                from_ticket: 0,
                to_ticket: msg.from_ticket,
                flags: 0,
                operation: ops::INDEX_RES.to_string(),
                body: format!("{} {} {}", id.to_base64(), owner.addr(), class.as_str()),
            };
            if let Err(e) = self.socket.send(&origin, &reply).await {
                tracing::debug!("Index reply to {} failed: {}", origin, e);
            }
        } else {
            tracing::trace!(
                "Forwarding index query for {} to {} ({:?} vs {:?})",
                id,
                owner,
                class,
                mode
            );
            if let Err(e) = self.socket.send(&owner, &msg).await {
                tracing::debug!("Index forward to {} failed: {}", owner, e);
            }
        }
    }

    /// Serves one inbound compound table query with one reply line per
    /// atomic query.
    pub async fn handle_table(&self, env: Envelope) {
        let msg = env.msg;
        let query = msg.body.lines().next().unwrap_or("").trim();
        let atoms = match decompose(query) {
            Ok(a) if !a.is_empty() => a,
            Ok(_) | Err(_) => {
                tracing::debug!("Dropping malformed table query from {}", env.from);
                return;
            }
        };
        let lines: Vec<String> = atoms.iter().map(|atom| self.resolve_atom(atom)).collect();
        let reply = Message {
            from_ticket: 0,
            to_ticket: msg.from_ticket,
            flags: 0,
            operation: ops::TABLE_RES.to_string(),
            body: lines.join("\n"),
        };
        if let Err(e) = self.socket.send_addr(env.from, &reply).await {
            tracing::debug!("Table reply to {} failed: {}", env.from, e);
        }
    }

    fn resolve_atom(&self, atom: &AtomicQuery) -> String {
        let value = match atom.reference.split_once(':') {
            Some((table, "size")) => self
                .table
                .list_by_name(table)
                .map(|list| list.len().to_string()),
            _ => self
                .table
                .resolve_reference(&atom.reference)
                .map(|h| h.addr()),
        };
        QueryResult {
            query_id: atom.query_id,
            op_id: atom.op_id,
            reference: atom.reference.clone(),
            value,
        }
        .encode()
    }
}
