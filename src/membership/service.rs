//! The membership engine: client-side connect/disconnect and the server-side
//! join/leave transaction handlers.
//!
//! Every handshake follows the same shape: a request, a `ready` admission, a
//! `commit` from the initiator, and a confirming `ack`. A node commits its
//! own link only after the other side of the splice has confirmed, so the
//! ring is never observed half-linked in one direction.

use super::types::{
    payload_option, AbortReason, AckKind, ClaimOutcome, Op, Outcome, SideGuard,
};
use crate::config::RingConfig;
use crate::lookup::{IterMode, Lookup};
use crate::net::message::{ops, Message};
use crate::net::{Envelope, MessageSocket, NodeHandle, Ticket};
use crate::tables::RoutingTable;
use anyhow::{anyhow, bail, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Splice retries against concurrent joiners before giving up on a leave.
const MAX_SPLICE_RETRIES: usize = 4;

pub struct Membership {
    table: Arc<RoutingTable>,
    lookup: Arc<Lookup>,
    socket: Arc<MessageSocket>,
    config: Arc<RingConfig>,
    succ_guard: SideGuard,
    pred_guard: SideGuard,
}

impl Membership {
    pub fn new(
        table: Arc<RoutingTable>,
        lookup: Arc<Lookup>,
        socket: Arc<MessageSocket>,
        config: Arc<RingConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            lookup,
            socket,
            config,
            succ_guard: SideGuard::new("succ"),
            pred_guard: SideGuard::new("pred"),
        })
    }

    fn me(&self) -> &Arc<NodeHandle> {
        self.table.me()
    }

    fn remaining(&self, deadline: Instant) -> Option<Duration> {
        deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }

    async fn backoff(&self) {
        let jitter = rand::thread_rng().gen_range(0..200);
        sleep(Duration::from_millis(100 + jitter)).await;
    }

    async fn respond(&self, to: &NodeHandle, request: &Message, outcome: &Outcome, ticket: u8) {
        let reply = outcome.to_reply(request, ticket);
        if let Err(e) = self.socket.send(to, &reply).await {
            tracing::debug!("Membership reply {} to {} failed: {}", outcome, to, e);
        }
    }

    // ------------------------------------------------------------------
    // Client side: connect
    // ------------------------------------------------------------------

    /// Joins the ring reachable through `hint`. Resolves the owner of our own
    /// identifier (the successor-to-be), asks that node's predecessor for
    /// admission, and commits both local links only once the master confirms.
    /// A failed join leaves no links behind.
    pub async fn connect(&self, hint: Arc<NodeHandle>) -> Result<()> {
        let me = self.me().clone();
        let _side = match self.succ_guard.try_claim(&hint.addr(), Op::Connect) {
            ClaimOutcome::Acquired(guard) => guard,
            _ => bail!("a membership transaction is already running"),
        };
        let deadline = Instant::now() + self.config.connect_timeout();

        let mut master = match self.resolve_master(&hint).await? {
            Some(m) => m,
            None => return self.verify_linked().await,
        };
        tracing::info!("Joining the ring via {} (master {})", hint, master);

        let mut ticket = self
            .socket
            .request_ticket()
            .map_err(|e| anyhow!("connect: {e}"))?;
        let join = Message::request(ops::JOIN, ticket.id(), format!("--host {}", me.addr()));

        // Phase one: get admitted by the master.
        let confirm = loop {
            let remaining = self
                .remaining(deadline)
                .ok_or_else(|| anyhow!("join via {} timed out", master))?;
            self.socket.send(&master, &join).await?;
            let wait = remaining.min(self.config.connect_msg_timeout());
            let reply = match ticket.receive(Some(&master), wait).await {
                Ok(reply) => reply,
                Err(_) => continue,
            };
            if reply.operation == ops::READY {
                // Admitted; the confirmation with our links follows.
                continue;
            }
            match Outcome::from_message(&reply) {
                Some(Outcome::Ack(AckKind::Confirm, _)) => break reply,
                Some(Outcome::Ack(_, _)) => self.backoff().await,
                Some(Outcome::Abort(AbortReason::ConcurrentConflict, _)) => self.backoff().await,
                Some(Outcome::Abort(AbortReason::WrongHost, _)) => {
                    // The ring moved underneath us; resolve again.
                    master = match self.resolve_master(&hint).await? {
                        Some(m) => m,
                        None => return self.verify_linked().await,
                    };
                    tracing::debug!("Join redirected, new master {}", master);
                }
                Some(Outcome::Abort(reason, _)) => {
                    bail!("join rejected by {}: {}", master, reason.as_str())
                }
                _ => tracing::debug!("Ignoring {} while joining", reply),
            }
        };

        // Phase two: install the links the master granted, then commit.
        if let Some(host) = confirm.option("host") {
            master = self.lookup.handle_for(host).map_err(|e| anyhow!("{e}"))?;
        }
        self.table.preds().insert_sorted(master.clone());
        let mut installed = Vec::new();
        for addr in confirm.options("succ") {
            let handle = match self.lookup.handle_for(addr) {
                Ok(h) => h,
                Err(e) => {
                    tracing::debug!("Skipping unusable successor {addr:?}: {e}");
                    continue;
                }
            };
            if !self.table.is_self(&handle) && self.table.succs().insert_sorted(handle.clone()) {
                installed.push(handle);
            }
        }

        let commit = Message::reply_to(&confirm, ops::COMMIT, ticket.id(), "");
        loop {
            let Some(remaining) = self.remaining(deadline) else {
                // Roll the half-installed links back; nothing must survive a
                // failed join.
                self.table.preds().remove(&master);
                for handle in &installed {
                    self.table.succs().remove(handle);
                }
                bail!("join commit to {} timed out", master);
            };
            if let Err(e) = self.socket.send(&master, &commit).await {
                tracing::debug!("Join commit send failed: {e}");
            }
            let wait = remaining.min(self.config.connect_msg_timeout());
            match ticket.receive(Some(&master), wait).await {
                Ok(reply) if matches!(Outcome::from_message(&reply), Some(Outcome::Ack(_, _))) => {
                    break;
                }
                Ok(other) => tracing::debug!("Ignoring {} while committing join", other),
                Err(_) => {
                    // The final ack is allowed to get lost; the master's own
                    // tables tell us whether the commit landed.
                    if let Ok(succ0) = self.lookup.lookup_table(&master, "succ:0").await {
                        if *succ0 == *me {
                            break;
                        }
                    }
                }
            }
        }
        self.table.preds().set_stable(false);
        self.table.succs().set_stable(false);
        tracing::info!("Joined the ring behind {}", master);
        Ok(())
    }

    /// Resolves the node that must master our join: the predecessor of
    /// whoever owns our identifier. `None` means the ring already routes our
    /// identifier to us.
    async fn resolve_master(&self, hint: &Arc<NodeHandle>) -> Result<Option<Arc<NodeHandle>>> {
        let me = self.me().clone();
        let succ = self
            .lookup
            .lookup(me.id(), IterMode::SelfOnly, Some(hint.clone()))
            .await?;
        if self.table.is_self(&succ) {
            return Ok(None);
        }
        // A bare node has no predecessor yet and masters its own join.
        match self.lookup.lookup_table(&succ, "pred:0").await {
            Ok(pred) => Ok(Some(pred)),
            Err(_) => Ok(Some(succ)),
        }
    }

    /// Called when the ring resolves our identifier back to us: either we are
    /// alone, or we are already linked in and the successor must agree.
    async fn verify_linked(&self) -> Result<()> {
        let Some(succ0) = self.table.succs().get(0) else {
            tracing::info!("No ring to join; starting alone");
            return Ok(());
        };
        match self.lookup.lookup_table(&succ0, "pred:0").await {
            Ok(pred) if *pred == **self.me() => {
                tracing::info!("Already a ring member, {} links back", succ0);
                Ok(())
            }
            _ => bail!("we own our identifier but {} does not link back", succ0),
        }
    }

    // ------------------------------------------------------------------
    // Client side: disconnect
    // ------------------------------------------------------------------

    /// Leaves the ring by handing our departure to the predecessor, then
    /// clears all local tables. A silent predecessor counts as a successful
    /// departure; the ring repairs itself either way.
    pub async fn disconnect(&self) -> bool {
        let me = self.me().clone();
        let _side = match self.succ_guard.try_claim(&me.addr(), Op::Disconnect) {
            ClaimOutcome::Acquired(guard) => Some(guard),
            _ => {
                tracing::warn!("Leaving while another membership transaction is in flight");
                None
            }
        };
        let Some(pred) = self.table.preds().get(0).filter(|p| !self.table.is_self(p)) else {
            self.table.clear_all();
            return true;
        };
        let mut clean = true;
        if let Ok(mut ticket) = self.socket.request_ticket() {
            let leave = Message::request(
                ops::LEAVE,
                ticket.id(),
                format!("--host {} --no-check --respond", me.addr()),
            );
            let deadline = Instant::now() + self.config.connect_timeout();
            while let Some(remaining) = self.remaining(deadline) {
                if self.socket.send(&pred, &leave).await.is_err() {
                    break;
                }
                let wait = remaining.min(self.config.msg_timeout());
                match ticket.receive(Some(&pred), wait).await {
                    Ok(reply) => match Outcome::from_message(&reply) {
                        Some(Outcome::Ack(_, _)) => break,
                        Some(Outcome::Abort(AbortReason::ConcurrentConflict, _)) => {
                            self.backoff().await;
                        }
                        Some(Outcome::Abort(reason, _)) => {
                            tracing::warn!("{} refused our leave: {}", pred, reason.as_str());
                            clean = false;
                            break;
                        }
                        _ => tracing::debug!("Ignoring {} while leaving", reply),
                    },
                    Err(_) => {} // resend; silence is assumed success
                }
            }
        }
        self.table.clear_all();
        tracing::info!("Left the ring");
        clean
    }

    /// Advisory leave: a neighbor has gone silent. Verifies it really is
    /// unreachable before splicing it out of the ring.
    pub fn check_leave(self: &Arc<Self>, peer: Arc<NodeHandle>) {
        let this = self.clone();
        tokio::spawn(async move {
            if this
                .socket
                .ping(&peer, this.config.ping_timeout(), this.config.ping_retry_count)
                .await
                .is_some()
            {
                peer.touch();
                return;
            }
            if this.lookup.lookup_tables(&peer, "succ:0").await.is_ok() {
                peer.touch();
                return;
            }
            let _side = match this.succ_guard.try_claim(&peer.addr(), Op::Leave) {
                ClaimOutcome::Acquired(guard) => guard,
                _ => return,
            };
            tracing::warn!("{} is silent and unreachable, splicing it out", peer);
            let outcome = this.leave_me(&peer).await;
            tracing::debug!("Forced leave of {}: {}", peer, outcome);
        });
    }

    // ------------------------------------------------------------------
    // Shared splice machinery
    // ------------------------------------------------------------------

    /// Splices `leaver` out of the local view: coordinates with the node
    /// after the leaver so its predecessor link is rewired to us before we
    /// drop ours.
    async fn leave_me(&self, leaver: &Arc<NodeHandle>) -> Outcome {
        if !self.table.succs().contains(leaver) && !self.table.preds().contains(leaver) {
            return Outcome::ack(AckKind::Confirm);
        }
        for _ in 0..MAX_SPLICE_RETRIES {
            let Some(after) = self.splice_coordinator(leaver) else {
                // Nothing beyond the leaver; the ring collapses onto us.
                self.remove_everywhere(leaver);
                return Outcome::ack(AckKind::Confirm);
            };
            match self.leave_pred_exchange(&after, leaver).await {
                Outcome::Ack(_, _) | Outcome::Commit(_) => {
                    self.remove_everywhere(leaver);
                    return Outcome::ack(AckKind::Confirm);
                }
                Outcome::Abort(AbortReason::ConcurrentConflict, payload) => {
                    // A joiner slid in between the leaver and `after`; adopt
                    // it and splice to it instead.
                    match payload_option(&payload, "mypred") {
                        Some(addr) => {
                            if let Ok(joiner) = self.lookup.handle_for(addr) {
                                self.table.succs().insert_sorted(joiner);
                            }
                        }
                        None => self.backoff().await,
                    }
                }
                Outcome::Abort(AbortReason::Timeout, _) => {
                    // The coordinator is gone too; cascade past it.
                    tracing::warn!("Splice coordinator {} is silent, evicting", after);
                    self.table.succs().remove(&after);
                    self.table.succs().set_stable(false);
                }
                abort => return abort,
            }
        }
        Outcome::abort(AbortReason::Timeout)
    }

    /// The first node after `leaver` in our forward view, falling back to the
    /// farthest predecessor when the successor list holds nothing beyond it.
    fn splice_coordinator(&self, leaver: &NodeHandle) -> Option<Arc<NodeHandle>> {
        let forward = self
            .table
            .succs()
            .snapshot()
            .into_iter()
            .find(|h| **h != *leaver && !self.table.is_self(h));
        forward.or_else(|| {
            self.table
                .preds()
                .snapshot()
                .into_iter()
                .rev()
                .find(|h| **h != *leaver && !self.table.is_self(h))
        })
    }

    fn remove_everywhere(&self, handle: &NodeHandle) {
        if self.table.succs().remove(handle) {
            self.table.succs().set_stable(false);
        }
        if self.table.preds().remove(handle) {
            self.table.preds().set_stable(false);
        }
        if self.table.fingers().remove(handle) {
            self.table.fingers().set_stable(false);
        }
    }

    /// Runs the `leave_pred` handshake against the node after the leaver.
    async fn leave_pred_exchange(
        &self,
        after: &Arc<NodeHandle>,
        leaver: &NodeHandle,
    ) -> Outcome {
        let mut ticket = match self.socket.request_ticket() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("leave_pred: {}", e);
                return Outcome::abort(AbortReason::Internal);
            }
        };
        let request = Message::request(
            ops::LEAVE_PRED,
            ticket.id(),
            format!("--host {} --origin {}", leaver.addr(), self.me().addr()),
        );
        let deadline = Instant::now() + self.config.joinpred_timeout();
        loop {
            let Some(remaining) = self.remaining(deadline) else {
                return Outcome::abort(AbortReason::Timeout);
            };
            if self.socket.send(after, &request).await.is_err() {
                return Outcome::abort(AbortReason::Internal);
            }
            let wait = remaining.min(self.config.msg_timeout());
            match ticket.receive(Some(after), wait).await {
                Ok(reply) => match Outcome::from_message(&reply) {
                    Some(Outcome::Ack(AckKind::Initiated, _)) => self.backoff().await,
                    Some(outcome) => return outcome,
                    None => tracing::debug!("Ignoring {} during leave_pred", reply),
                },
                Err(_) => {} // resend
            }
        }
    }

    // ------------------------------------------------------------------
    // Server side: join
    // ------------------------------------------------------------------

    /// Serves a `join` request as the joiner's predecessor-to-be: links the
    /// delegate (our current successor) back to the joiner first, and commits
    /// our own forward link only on the joiner's commit.
    pub async fn handle_join(&self, env: Envelope) {
        let msg = env.msg;
        let joiner = match msg.option("host").map(|h| self.lookup.handle_for(h)) {
            Some(Ok(j)) => j,
            _ => {
                tracing::warn!("Dropping join without a valid --host");
                return;
            }
        };
        if self.table.is_self(&joiner) {
            tracing::debug!("Ignoring join from ourselves");
            return;
        }
        let mut ticket = match self.socket.request_ticket() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("join: {}", e);
                return;
            }
        };
        if joiner.id() == self.me().id() {
            self.respond(
                &joiner,
                &msg,
                &Outcome::abort(AbortReason::IndexCollision),
                ticket.id(),
            )
            .await;
            return;
        }
        let _side = match self.succ_guard.try_claim(&joiner.addr(), Op::Join) {
            ClaimOutcome::Acquired(guard) => guard,
            ClaimOutcome::AlreadyInitiated => {
                self.respond(&joiner, &msg, &Outcome::ack(AckKind::Initiated), ticket.id())
                    .await;
                return;
            }
            ClaimOutcome::Busy => {
                self.respond(
                    &joiner,
                    &msg,
                    &Outcome::abort(AbortReason::ConcurrentConflict),
                    ticket.id(),
                )
                .await;
                return;
            }
        };
        self.admit_joiner(joiner, msg, &mut ticket).await;
    }

    async fn admit_joiner(&self, joiner: Arc<NodeHandle>, request: Message, ticket: &mut Ticket) {
        let me = self.me().clone();

        // Settle the delegate: the joiner's successor-to-be must link back to
        // the joiner before we commit anything ourselves.
        let mut evictions = 0;
        let granted = loop {
            match self.table.succs().get(0) {
                None => {
                    // Bare node: the ring closes between the two of us.
                    break format!("--host {} --succ {}", me.addr(), me.addr());
                }
                Some(succ0) if *succ0 == *joiner => {
                    // Re-run of a join we already committed.
                    break self.succ_payload(&joiner);
                }
                Some(succ0) => {
                    if joiner.id() == succ0.id() {
                        self.respond(
                            &joiner,
                            &request,
                            &Outcome::abort(AbortReason::IndexCollision),
                            ticket.id(),
                        )
                        .await;
                        return;
                    }
                    if !joiner.id().between(me.id(), succ0.id()) {
                        self.respond(
                            &joiner,
                            &request,
                            &Outcome::abort(AbortReason::WrongHost),
                            ticket.id(),
                        )
                        .await;
                        return;
                    }
                    match self.join_pred_exchange(&succ0, &joiner).await {
                        Outcome::Ack(_, _) | Outcome::Commit(_) => {
                            break self.succ_payload(&joiner);
                        }
                        Outcome::Abort(AbortReason::Timeout, _) => {
                            evictions += 1;
                            if evictions > MAX_SPLICE_RETRIES {
                                self.respond(
                                    &joiner,
                                    &request,
                                    &Outcome::abort(AbortReason::Cascading),
                                    ticket.id(),
                                )
                                .await;
                                return;
                            }
                            tracing::warn!("Join delegate {} is silent, evicting", succ0);
                            self.table.succs().remove(&succ0);
                            self.table.succs().set_stable(false);
                        }
                        Outcome::Abort(AbortReason::WrongHost, _) => {
                            self.respond(
                                &joiner,
                                &request,
                                &Outcome::abort(AbortReason::WrongHost),
                                ticket.id(),
                            )
                            .await;
                            return;
                        }
                        Outcome::Abort(reason, _) => {
                            tracing::warn!(
                                "Delegate {} aborted the join: {}",
                                succ0,
                                reason.as_str()
                            );
                            self.respond(
                                &joiner,
                                &request,
                                &Outcome::abort(AbortReason::Cascading),
                                ticket.id(),
                            )
                            .await;
                            return;
                        }
                    }
                }
            }
        };

        // Admission granted; hand the joiner its links and wait for commit.
        let ready = Message::reply_to(&request, ops::READY, ticket.id(), "");
        if let Err(e) = self.socket.send(&joiner, &ready).await {
            tracing::debug!("Join ready to {} failed: {}", joiner, e);
        }
        let confirm = Outcome::Ack(AckKind::Confirm, granted);
        let deadline = Instant::now() + self.config.joinpred_timeout();
        loop {
            self.respond(&joiner, &request, &confirm, ticket.id()).await;
            let Some(remaining) = self.remaining(deadline) else {
                tracing::warn!("Joiner {} never committed; dropping the join", joiner);
                return;
            };
            let wait = remaining.min(self.config.msg_timeout());
            match ticket.receive(Some(&joiner), wait).await {
                Ok(reply) if reply.operation == ops::COMMIT => {
                    self.table.succs().insert_sorted(joiner.clone());
                    self.table.succs().set_stable(false);
                    if self.table.preds().is_empty() {
                        // Bare node bootstrap: the joiner closes the ring
                        // behind us too.
                        self.table.preds().insert_sorted(joiner.clone());
                        self.table.preds().set_stable(false);
                    }
                    self.respond(&joiner, &reply, &Outcome::ack(AckKind::Confirm), ticket.id())
                        .await;
                    tracing::info!("Admitted {} as immediate successor", joiner);
                    return;
                }
                Ok(other) => tracing::debug!("Ignoring {} while awaiting commit", other),
                Err(_) => {} // resend the confirmation
            }
        }
    }

    /// `--host me --succ a --succ b ...` for the joiner's successor list,
    /// skipping the joiner itself.
    fn succ_payload(&self, joiner: &NodeHandle) -> String {
        let me = self.me();
        let mut payload = format!("--host {}", me.addr());
        let mut any = false;
        for handle in self.table.succs().snapshot() {
            if *handle == *joiner {
                continue;
            }
            payload.push_str(&format!(" --succ {}", handle.addr()));
            any = true;
        }
        if !any {
            payload.push_str(&format!(" --succ {}", me.addr()));
        }
        payload
    }

    /// Runs the nested `join_pred` handshake against the delegate.
    async fn join_pred_exchange(
        &self,
        delegate: &Arc<NodeHandle>,
        joiner: &NodeHandle,
    ) -> Outcome {
        let mut ticket = match self.socket.request_ticket() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("join_pred: {}", e);
                return Outcome::abort(AbortReason::Internal);
            }
        };
        let request = Message::request(
            ops::JOIN_PRED,
            ticket.id(),
            format!("--host {} --origin {}", joiner.addr(), self.me().addr()),
        );
        let mut commit: Option<Message> = None;
        let deadline = Instant::now() + self.config.joinpred_timeout();
        loop {
            let Some(remaining) = self.remaining(deadline) else {
                return Outcome::abort(AbortReason::Timeout);
            };
            let outbound = commit.as_ref().unwrap_or(&request);
            if self.socket.send(delegate, outbound).await.is_err() {
                return Outcome::abort(AbortReason::Internal);
            }
            let wait = remaining.min(self.config.msg_timeout());
            match ticket.receive(Some(delegate), wait).await {
                Ok(reply) if reply.operation == ops::READY => {
                    commit = Some(Message::reply_to(&reply, ops::COMMIT, ticket.id(), ""));
                }
                Ok(reply) => match Outcome::from_message(&reply) {
                    Some(Outcome::Ack(AckKind::Confirm, payload)) => {
                        // Best-effort closing ack; the delegate's insert holds
                        // even if this is lost.
                        let closing =
                            Message::reply_to(&reply, ops::ACK, ticket.id(), "--msg confirm");
                        if let Err(e) = self.socket.send(delegate, &closing).await {
                            tracing::debug!("Closing ack to {} failed: {}", delegate, e);
                        }
                        return Outcome::Ack(AckKind::Confirm, payload);
                    }
                    Some(Outcome::Ack(AckKind::Initiated, _)) => self.backoff().await,
                    Some(outcome) => return outcome,
                    None => tracing::debug!("Ignoring {} during join_pred", reply),
                },
                Err(_) => {} // resend request or commit
            }
        }
    }

    /// Serves a `join_pred` request as the joiner's successor-to-be: inserts
    /// the joiner into the predecessor list once the master commits.
    pub async fn handle_join_pred(&self, env: Envelope) {
        let msg = env.msg;
        let (joiner, origin) = match (
            msg.option("host").map(|h| self.lookup.handle_for(h)),
            msg.option("origin").map(|o| self.lookup.handle_for(o)),
        ) {
            (Some(Ok(j)), Some(Ok(o))) => (j, o),
            _ => {
                tracing::warn!("Dropping join_pred without valid --host/--origin");
                return;
            }
        };
        let me = self.me().clone();
        let mut ticket = match self.socket.request_ticket() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("join_pred: {}", e);
                return;
            }
        };
        if joiner.id() == me.id() {
            self.respond(
                &origin,
                &msg,
                &Outcome::abort(AbortReason::IndexCollision),
                ticket.id(),
            )
            .await;
            return;
        }
        let _side = match self.pred_guard.try_claim(&joiner.addr(), Op::JoinPred) {
            ClaimOutcome::Acquired(guard) => guard,
            ClaimOutcome::AlreadyInitiated => {
                self.respond(&origin, &msg, &Outcome::ack(AckKind::Initiated), ticket.id())
                    .await;
                return;
            }
            ClaimOutcome::Busy => {
                self.respond(
                    &origin,
                    &msg,
                    &Outcome::abort(AbortReason::ConcurrentConflict),
                    ticket.id(),
                )
                .await;
                return;
            }
        };

        let Some(pred0) = self.table.preds().get(0) else {
            // A bare node cannot validate the joiner's placement; the master
            // must not have delegated to us.
            tracing::warn!("join_pred from {} while we have no predecessor", origin);
            self.respond(
                &origin,
                &msg,
                &Outcome::abort(AbortReason::Internal),
                ticket.id(),
            )
            .await;
            return;
        };
        if *pred0 == *joiner {
            // Already linked from an earlier attempt.
            self.respond(&origin, &msg, &Outcome::ack(AckKind::Confirm), ticket.id())
                .await;
            return;
        }
        if joiner.id() == pred0.id() {
            self.respond(
                &origin,
                &msg,
                &Outcome::abort(AbortReason::IndexCollision),
                ticket.id(),
            )
            .await;
            return;
        }
        if !joiner.id().between(pred0.id(), me.id()) {
            self.respond(
                &origin,
                &msg,
                &Outcome::abort(AbortReason::WrongHost),
                ticket.id(),
            )
            .await;
            return;
        }

        let ready = Message::reply_to(&msg, ops::READY, ticket.id(), "");
        let deadline = Instant::now() + self.config.joinpred_timeout();
        loop {
            if let Err(e) = self.socket.send(&origin, &ready).await {
                tracing::debug!("join_pred ready to {} failed: {}", origin, e);
            }
            let Some(remaining) = self.remaining(deadline) else {
                tracing::warn!("Master {} never committed join_pred; dropping", origin);
                return;
            };
            let wait = remaining.min(self.config.msg_timeout());
            match ticket.receive(Some(&origin), wait).await {
                Ok(reply) if reply.operation == ops::COMMIT => {
                    self.table.preds().insert_sorted(joiner.clone());
                    self.table.preds().set_stable(false);
                    self.respond(&origin, &reply, &Outcome::ack(AckKind::Confirm), ticket.id())
                        .await;
                    // The master's closing ack is best-effort.
                    let _ = ticket
                        .receive(Some(&origin), self.config.msg_timeout())
                        .await;
                    tracing::info!("Linked {} as immediate predecessor", joiner);
                    return;
                }
                Ok(reply) if reply.operation == ops::ABORT => return,
                Ok(other) => tracing::debug!("Ignoring {} during join_pred", other),
                Err(_) => {} // resend ready
            }
        }
    }

    // ------------------------------------------------------------------
    // Server side: leave
    // ------------------------------------------------------------------

    /// Serves a `leave` request as the leaver's predecessor: splices the
    /// leaver out by rewiring the node after it, then drops the local links.
    pub async fn handle_leave(&self, env: Envelope) {
        let msg = env.msg;
        let leaver = match msg.option("host").map(|h| self.lookup.handle_for(h)) {
            Some(Ok(l)) => l,
            _ => {
                tracing::warn!("Dropping leave without a valid --host");
                return;
            }
        };
        let respond = msg.has_option("respond");
        let advisory = msg.has_option("check") && !msg.has_option("no-check");
        let ticket = match self.socket.request_ticket() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("leave: {}", e);
                return;
            }
        };
        if advisory {
            // Only honor third-party reports when the host really is gone.
            let alive = self
                .socket
                .ping(&leaver, self.config.ping_timeout(), self.config.ping_retry_count)
                .await
                .is_some()
                || self.lookup.lookup_tables(&leaver, "succ:0").await.is_ok();
            if alive {
                leaver.touch();
                if respond {
                    let reply = Outcome::ack(AckKind::TableSafe).to_reply(&msg, ticket.id());
                    if let Err(e) = self.socket.send_addr(env.from, &reply).await {
                        tracing::debug!("leave table_safe reply failed: {}", e);
                    }
                }
                return;
            }
        }
        let _side = match self.succ_guard.try_claim(&leaver.addr(), Op::Leave) {
            ClaimOutcome::Acquired(guard) => Some(guard),
            ClaimOutcome::AlreadyInitiated => {
                if respond {
                    let reply = Outcome::ack(AckKind::Initiated).to_reply(&msg, ticket.id());
                    let _ = self.socket.send_addr(env.from, &reply).await;
                }
                return;
            }
            ClaimOutcome::Busy => {
                if respond {
                    let reply =
                        Outcome::abort(AbortReason::ConcurrentConflict).to_reply(&msg, ticket.id());
                    let _ = self.socket.send_addr(env.from, &reply).await;
                }
                return;
            }
        };
        let outcome = self.leave_me(&leaver).await;
        tracing::info!("Leave of {}: {}", leaver, outcome);
        if respond {
            let reply = outcome.to_reply(&msg, ticket.id());
            if let Err(e) = self.socket.send_addr(env.from, &reply).await {
                tracing::debug!("Leave reply failed: {}", e);
            }
        }
    }

    /// Serves a `leave_pred` request as the node after the leaver: rewires
    /// the predecessor link to the splicing origin.
    pub async fn handle_leave_pred(&self, env: Envelope) {
        let msg = env.msg;
        let (leaver, origin) = match (
            msg.option("host").map(|h| self.lookup.handle_for(h)),
            msg.option("origin").map(|o| self.lookup.handle_for(o)),
        ) {
            (Some(Ok(l)), Some(Ok(o))) => (l, o),
            _ => {
                tracing::warn!("Dropping leave_pred without valid --host/--origin");
                return;
            }
        };
        let ticket = match self.socket.request_ticket() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("leave_pred: {}", e);
                return;
            }
        };
        let _side = match self.pred_guard.try_claim(&leaver.addr(), Op::LeavePred) {
            ClaimOutcome::Acquired(guard) => guard,
            ClaimOutcome::AlreadyInitiated => {
                self.respond(&origin, &msg, &Outcome::ack(AckKind::Initiated), ticket.id())
                    .await;
                return;
            }
            ClaimOutcome::Busy => {
                self.respond(
                    &origin,
                    &msg,
                    &Outcome::abort(AbortReason::ConcurrentConflict),
                    ticket.id(),
                )
                .await;
                return;
            }
        };

        let outcome = match self.table.preds().get(0) {
            None => {
                // Empty view: adopt the splicing origin as predecessor.
                self.table.preds().insert_sorted(origin.clone());
                self.table.preds().set_stable(false);
                Outcome::ack(AckKind::Confirm)
            }
            Some(pred0) if *pred0 == *leaver => {
                self.remove_everywhere(&leaver);
                if self.table.preds().is_empty() {
                    self.table.preds().insert_sorted(origin.clone());
                }
                self.table.preds().set_stable(false);
                tracing::info!("Spliced {} out, {} is the new predecessor", leaver, origin);
                Outcome::ack(AckKind::Confirm)
            }
            Some(_) if !self.table.preds().contains(&leaver) => {
                // Already gone.
                Outcome::ack(AckKind::Confirm)
            }
            Some(pred0) => {
                if pred0.id().between(leaver.id(), self.me().id()) {
                    // A joiner slid in between; the origin must splice to it.
                    Outcome::Abort(
                        AbortReason::ConcurrentConflict,
                        format!("--mypred {}", pred0.addr()),
                    )
                } else {
                    Outcome::abort(AbortReason::Internal)
                }
            }
        };
        self.respond(&origin, &msg, &outcome, ticket.id()).await;
    }
}
