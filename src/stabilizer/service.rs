//! The stabilizer daemon: sizing policy, the balance test, and the repair
//! loop that drives the table-level stabilization phases.

use crate::config::RingConfig;
use crate::id::{Id, IdFactory};
use crate::lookup::Lookup;
use crate::net::MessageSocket;
use crate::tables::stabilize::{
    finger_target, grow_fingers, repair_fingers, stabilize_grow, stabilize_liveness,
    stabilize_repair,
};
use crate::tables::RoutingTable;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;

/// How many entries of an estimated ring size `n` belong in each neighbor
/// list: all of them up to the protected minimum, then a configured fraction
/// of the remainder.
pub fn neighbor_count(n: usize, config: &RingConfig) -> usize {
    if n <= config.min_succ {
        n
    } else {
        let extra = (n - config.min_succ) as f64 * config.succ_ratio;
        config.min_succ + extra.floor() as usize
    }
}

/// The finger slots left over once the neighbor lists took their share.
pub fn finger_count(n: usize, config: &RingConfig) -> usize {
    n - neighbor_count(n, config)
}

/// Verdict of the balance test for one candidate ring size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Balance {
    /// The candidate shape closes the ring without overlap.
    Stable,
    /// The covered span leaves a gap; try a larger size.
    Grow,
    /// The shape overlaps itself or cannot be filled; try a smaller size.
    Shrink,
}

pub struct Stabilizer {
    table: Arc<RoutingTable>,
    lookup: Arc<Lookup>,
    socket: Arc<MessageSocket>,
    factory: Arc<dyn IdFactory>,
    config: Arc<RingConfig>,
    shutdown: Notify,
}

impl Stabilizer {
    pub fn new(
        table: Arc<RoutingTable>,
        lookup: Arc<Lookup>,
        socket: Arc<MessageSocket>,
        factory: Arc<dyn IdFactory>,
        config: Arc<RingConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            lookup,
            socket,
            factory,
            config,
            shutdown: Notify::new(),
        })
    }

    /// Spawns the maintenance loop.
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
        let backoff_every = (self.config.backoff_cycle_ms / self.config.concurrent_cycle_ms.max(1))
            .max(1);
        let mut cycle: u64 = 0;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::debug!("Stabilizer stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.concurrent_cycle()) => {}
            }
            cycle += 1;
            self.liveness_pass().await;
            if !self.table.is_stable() || cycle % backoff_every == 0 {
                self.repair_pass().await;
                self.rebalance().await;
            }
        }
    }

    /// Probes aging entries beyond the primary neighbors and evicts the
    /// silent ones.
    pub async fn liveness_pass(&self) {
        stabilize_liveness(self.table.succs(), &self.socket, &self.config).await;
        stabilize_liveness(self.table.preds(), &self.socket, &self.config).await;
    }

    /// Reconciles each container against the authoritative chains of its own
    /// entries.
    pub async fn repair_pass(&self) {
        stabilize_repair(self.table.succs(), &self.lookup, &self.config).await;
        stabilize_repair(self.table.preds(), &self.lookup, &self.config).await;
        repair_fingers(
            self.table.fingers(),
            &self.lookup,
            &*self.factory,
            self.lookup.default_mode(),
        )
        .await;
    }

    /// Walks the estimated ring size up or down until the container shape
    /// passes the balance test, then crops to the winning shape and marks
    /// all three containers stable. Gives up for this cycle after a bounded
    /// number of steps.
    pub async fn rebalance(&self) {
        let preds = self.table.preds();
        let succs = self.table.succs();
        let fingers = self.table.fingers();

        if preds.is_empty() && succs.is_empty() {
            // Alone; an empty shape is the correct one.
            fingers.clear();
            preds.set_stable(true);
            succs.set_stable(true);
            fingers.set_stable(true);
            return;
        }
        if preds.is_empty() || succs.is_empty() {
            tracing::error!(
                "Broken ring state: pred={} succ={} entries",
                preds.len(),
                succs.len()
            );
            preds.set_stable(false);
            succs.set_stable(false);
            return;
        }

        let mut n = (succs.len() + fingers.len()).max(1);
        for _ in 0..self.config.rebalance_max_iter.max(1) {
            let nc = neighbor_count(n, &self.config);
            let fc = finger_count(n, &self.config);
            stabilize_grow(succs, &self.lookup, self.table.me(), nc).await;
            stabilize_grow(preds, &self.lookup, self.table.me(), nc).await;
            grow_fingers(
                fingers,
                &self.lookup,
                &*self.factory,
                self.table.me(),
                fc,
                self.lookup.default_mode(),
            )
            .await;
            match self.balance_test(n).await {
                Balance::Stable => {
                    succs.crop(nc);
                    preds.crop(nc);
                    fingers.crop(fc);
                    succs.set_stable(true);
                    preds.set_stable(true);
                    fingers.set_stable(true);
                    tracing::debug!("Rebalanced to n={} (nc={} fc={})", n, nc, fc);
                    return;
                }
                Balance::Grow => n += 1,
                Balance::Shrink => {
                    if n <= 1 {
                        break;
                    }
                    n -= 1;
                }
            }
        }
        tracing::debug!("Rebalance did not settle this cycle (n={})", n);
    }

    /// Tests one candidate ring size against the current containers.
    ///
    /// Redundancy: the successor tail must not lap into ground the
    /// predecessors (or the fingers) already cover; meeting the predecessor
    /// tail exactly is the legitimate full-circle case. Completeness: the
    /// covered span must close the ring, or reach the border point, or reach
    /// the handoff to the lowest finger. An unreachable boundary entry fails
    /// the candidate toward Shrink.
    pub async fn balance_test(&self, n: usize) -> Balance {
        let nc = neighbor_count(n, &self.config);
        let fc = finger_count(n, &self.config);
        let me = self.table.me();
        let succs = self.table.succs();
        let preds = self.table.preds();
        let fingers = self.table.fingers();

        let Some(succ_tail) = succs.get(nc as isize - 1) else {
            return Balance::Shrink;
        };
        let Some(pred_tail) = preds.get(nc as isize - 1) else {
            return Balance::Shrink;
        };

        if fc == 0 {
            if *succ_tail != *pred_tail && succ_tail.id().between(pred_tail.id(), me.id()) {
                return Balance::Shrink;
            }
        } else {
            let Some(finger_far) = fingers.get(fc as isize - 1) else {
                return Balance::Shrink;
            };
            if !succ_tail.id().between(me.id(), finger_far.id()) {
                return Balance::Shrink;
            }
        }

        if fc == 0 {
            if nc < self.config.min_succ {
                let after = match self.lookup.lookup_table(&succ_tail, "succ:0").await {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::debug!("Balance test lost {} ({})", succ_tail, e);
                        return Balance::Shrink;
                    }
                };
                let closes = *after == **me
                    || *after == *pred_tail
                    || after.id().between(pred_tail.id(), me.id());
                if !closes {
                    return Balance::Grow;
                }
            } else {
                let border = self.border();
                let reach = succs.distance(succ_tail.id());
                if reach.compare(&succs.distance(&border)) == Ordering::Less {
                    return Balance::Grow;
                }
            }
        } else {
            let handoff = finger_target(me.id(), &*self.factory, fc);
            let reach = succs.distance(succ_tail.id());
            if reach.compare(&succs.distance(&handoff)) == Ordering::Less {
                return Balance::Grow;
            }
        }
        Balance::Stable
    }

    /// Three quarters of the way around the ring from the owner: the point a
    /// finger-less successor list must reach before it may stop growing.
    fn border(&self) -> Id {
        self.table
            .me()
            .id()
            .add(&self.factory.reference_point(1))
            .add(&self.factory.reference_point(2))
    }
}
