//! The stabilization phases.
//!
//! Direction-aware free functions shared by all three containers. Each phase
//! follows the same locking discipline: never hold the container lock across
//! a remote call: snapshot the version, call out, and commit through
//! `insert_if_version`, discarding the result if anything moved meanwhile.

use super::list::{Direction, NeighborList};
use crate::config::RingConfig;
use crate::id::{Id, IdFactory};
use crate::lookup::{IterMode, Lookup};
use crate::net::{MessageSocket, NodeHandle};
use std::cmp::Ordering;
use std::sync::Arc;

/// Remote table reference naming a boundary entry's own nearest neighbor in
/// this list's direction.
fn chain_reference(list: &NeighborList) -> &'static str {
    match list.direction() {
        Direction::Ascending => "succ:0",
        Direction::Descending => "pred:0",
        Direction::Unsorted => "succ:0",
    }
}

/// Logical target identifier for finger slot `i`: the owner plus
/// `2^(8L) >> (i+1)`, halving the span per slot.
pub fn finger_target(base: &Id, factory: &dyn IdFactory, slot: usize) -> Id {
    base.add(&factory.reference_point(slot as i32 + 1))
}

/// Cheap liveness sweep: probe every entry beyond the primary neighbor whose
/// last contact is older than the liveness threshold; evict the ones that do
/// not answer. The list counts as stable if the sweep completes with the
/// version unchanged from its start.
pub async fn stabilize_liveness(
    list: &NeighborList,
    socket: &Arc<MessageSocket>,
    config: &RingConfig,
) {
    let start_version = list.version();
    for entry in list.snapshot().into_iter().skip(1) {
        if entry.age_ms() <= config.alive_timeout_ms {
            continue;
        }
        let answered = socket
            .ping(&entry, config.ping_timeout(), config.ping_retry_count)
            .await;
        if answered.is_none() {
            tracing::info!("{}: evicting silent entry {}", list.name(), entry);
            list.remove(&entry);
            list.set_stable(false);
        }
    }
    if list.version() == start_version {
        list.set_stable(true);
    }
}

/// Structural repair beyond the protected `min_succ` prefix: ask each
/// boundary entry for its own nearest neighbor and reconcile: insert the
/// node it names when we have a gap, evict our next entry when the remote
/// chain bypasses it.
pub async fn stabilize_repair(list: &NeighborList, lookup: &Lookup, config: &RingConfig) {
    let reference = chain_reference(list);
    let mut index = config.min_succ.saturating_sub(1);
    // Each step either advances or strictly shrinks the list.
    let mut budget = list.len() * 2 + 4;
    while budget > 0 {
        budget -= 1;
        let entry = match list.get(index as isize) {
            Some(e) => e,
            None => break,
        };
        let next_local = match list.get(index as isize + 1) {
            Some(e) => e,
            None => break,
        };
        let next_remote = match lookup.lookup_table(&entry, reference).await {
            Ok(h) => h,
            Err(e) => {
                tracing::info!(
                    "{}: boundary entry {} unresponsive ({}), evicting",
                    list.name(),
                    entry,
                    e
                );
                list.remove(&entry);
                list.set_stable(false);
                continue;
            }
        };
        if *next_remote == *next_local {
            index += 1;
            continue;
        }
        if next_remote.id() == list.base() {
            // Chain wrapped back to the owner; everything past this entry is
            // redundant.
            list.crop(index + 1);
            break;
        }
        let d_remote = list.distance(next_remote.id());
        let d_local = list.distance(next_local.id());
        if d_remote.compare(&d_local) == Ordering::Less {
            tracing::debug!(
                "{}: inserting chain gap {} before {}",
                list.name(),
                next_remote,
                next_local
            );
            list.insert_sorted(next_remote);
            index += 1;
        } else {
            tracing::info!(
                "{}: evicting {} bypassed by authoritative chain",
                list.name(),
                next_local
            );
            list.remove(&next_local);
            list.set_stable(false);
        }
    }
}

/// Extends the list toward `target` by walking the chain from the current
/// tail via remote nearest-neighbor queries. A version change during the
/// in-flight remote call discards that step and stops growing this cycle.
pub async fn stabilize_grow(
    list: &NeighborList,
    lookup: &Lookup,
    me: &NodeHandle,
    target: usize,
) {
    let reference = chain_reference(list);
    while list.len() < target {
        let tail = match list.last() {
            // An empty list has no chain to walk; membership seeds it.
            Some(t) => t,
            None => return,
        };
        let snapshot = list.version();
        let next = match lookup.lookup_table(&tail, reference).await {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!("{}: grow stopped at {} ({})", list.name(), tail, e);
                return;
            }
        };
        if *next == *me || *next == *tail {
            // Walked the full circle (or a self-loop); the ring is smaller
            // than the target.
            return;
        }
        if !list.insert_if_version(next, snapshot) {
            return;
        }
    }
}

/// Re-resolves every finger slot through a full lookup, using the current
/// entry as routing hint. Fingers have no reciprocal link back, so a direct
/// chain query cannot repair them.
pub async fn repair_fingers(
    fingers: &NeighborList,
    lookup: &Lookup,
    factory: &dyn IdFactory,
    mode: IterMode,
) {
    for slot in 0..fingers.len() {
        let entry = match fingers.get(slot as isize) {
            Some(e) => e,
            None => break,
        };
        let target = finger_target(fingers.base(), factory, slot);
        match lookup.lookup(&target, mode, Some(entry.clone())).await {
            Ok(owner) => {
                if *owner != *entry {
                    tracing::debug!(
                        "finger: slot {} moved from {} to {}",
                        slot,
                        entry,
                        owner
                    );
                    fingers.remove(&entry);
                    fingers.insert_sorted(owner);
                }
            }
            Err(e) => {
                tracing::info!("finger: evicting unresolvable slot {} ({})", slot, e);
                fingers.remove(&entry);
                fingers.set_stable(false);
            }
        }
    }
}

/// Extends the finger table toward `target` slots, resolving each new slot's
/// target identifier through a full lookup under the version guard.
pub async fn grow_fingers(
    fingers: &NeighborList,
    lookup: &Lookup,
    factory: &dyn IdFactory,
    me: &NodeHandle,
    target: usize,
    mode: IterMode,
) {
    while fingers.len() < target {
        let slot = fingers.len();
        let target_id = finger_target(fingers.base(), factory, slot);
        let snapshot = fingers.version();
        let owner = match lookup.lookup(&target_id, mode, None).await {
            Ok(o) => o,
            Err(e) => {
                tracing::debug!("finger: grow stopped at slot {} ({})", slot, e);
                return;
            }
        };
        if *owner == *me {
            // The ring is too small for another finger.
            return;
        }
        if !fingers.insert_if_version(owner, snapshot) {
            return;
        }
    }
}
