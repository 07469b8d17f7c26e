//! The routing aggregate: one predecessor list, one successor list, one
//! finger table, and the owning node's handle, with unified ownership
//! resolution and string-addressed table references.

use super::list::{Direction, NeighborList};
use crate::id::Id;
use crate::net::NodeHandle;
use std::sync::Arc;

pub struct RoutingTable {
    me: Arc<NodeHandle>,
    preds: NeighborList,
    succs: NeighborList,
    fingers: NeighborList,
}

impl RoutingTable {
    pub fn new(me: Arc<NodeHandle>) -> Self {
        let base = me.id().clone();
        Self {
            me,
            preds: NeighborList::new("pred", Direction::Descending, base.clone()),
            succs: NeighborList::new("succ", Direction::Ascending, base.clone()),
            fingers: NeighborList::new("finger", Direction::Descending, base),
        }
    }

    pub fn me(&self) -> &Arc<NodeHandle> {
        &self.me
    }

    pub fn preds(&self) -> &NeighborList {
        &self.preds
    }

    pub fn succs(&self) -> &NeighborList {
        &self.succs
    }

    pub fn fingers(&self) -> &NeighborList {
        &self.fingers
    }

    /// The single place "is this handle the local node" is decided.
    pub fn is_self(&self, handle: &NodeHandle) -> bool {
        *handle == *self.me
    }

    /// Best local guess of the node responsible for `id`: predecessor list,
    /// then finger table, then successor list, each under its own coverage
    /// test; defaults to self.
    pub fn owner_of(&self, id: &Id) -> Arc<NodeHandle> {
        if let Some(owner) = self.preds.owner_of(id) {
            return owner;
        }
        if let Some(owner) = self.fingers.owner_of(id) {
            return owner;
        }
        if let Some(owner) = self.succs.owner_of(id) {
            return owner;
        }
        self.me.clone()
    }

    /// Resolves a `"table:index"` reference (`pred`/`succ`/`finger` crossed
    /// with `first`/`last`/integer, negative counting from the tail). Any
    /// parse or bounds failure is `None`, never an error.
    pub fn resolve_reference(&self, reference: &str) -> Option<Arc<NodeHandle>> {
        let (table, index) = reference.split_once(':')?;
        let list = self.list_by_name(table)?;
        let index: isize = match index {
            "first" => 0,
            "last" => -1,
            other => other.parse().ok()?,
        };
        list.get(index)
    }

    pub fn list_by_name(&self, name: &str) -> Option<&NeighborList> {
        match name {
            "pred" => Some(&self.preds),
            "succ" => Some(&self.succs),
            "finger" => Some(&self.fingers),
            _ => None,
        }
    }

    /// A handle whose tables can be trusted for an authoritative answer:
    /// self, or present in a stable predecessor list, or present in a stable
    /// successor list excluding its last entry (the tail is exactly the spot
    /// staleness accumulates).
    pub fn is_safe(&self, handle: &NodeHandle) -> bool {
        if self.is_self(handle) {
            return true;
        }
        if self.preds.stable() && self.preds.contains(handle) {
            return true;
        }
        if self.succs.stable() {
            if let Some(position) = self.succs.position(handle) {
                return position + 1 < self.succs.len();
            }
        }
        false
    }

    pub fn contains(&self, handle: &NodeHandle) -> bool {
        self.is_self(handle)
            || self.preds.contains(handle)
            || self.succs.contains(handle)
            || self.fingers.contains(handle)
    }

    /// Canonical shared handle for an endpoint already known to any table
    /// (or self), so timestamp touches reach every holder.
    pub fn find_handle(&self, addr: &str) -> Option<Arc<NodeHandle>> {
        if self.me.addr() == addr {
            return Some(self.me.clone());
        }
        self.preds
            .find_by_addr(addr)
            .or_else(|| self.succs.find_by_addr(addr))
            .or_else(|| self.fingers.find_by_addr(addr))
    }

    /// Drops every entry from all three tables (disconnect).
    pub fn clear_all(&self) {
        self.preds.clear();
        self.succs.clear();
        self.fingers.clear();
    }

    /// Ring stability is the conjunction of the three containers' flags.
    pub fn is_stable(&self) -> bool {
        self.preds.stable() && self.succs.stable() && self.fingers.stable()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RoutingTable({} {:?} {:?} {:?})",
            self.me, self.preds, self.succs, self.fingers
        )
    }
}
