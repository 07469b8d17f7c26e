//! The generic neighbor container.
//!
//! One list type covers all three tables; the sort discipline is a
//! `Direction` value supplied at construction, not a subtype. Entries are
//! kept sorted by circular distance from the owning node's identifier in the
//! stated direction, with no duplicate identifiers.
//!
//! Every mutation bumps a monotonic version counter. Callers performing a
//! remote call between a read and a dependent insert snapshot the version
//! first and commit through `insert_if_version`, which discards the insert if
//! anything moved in between (optimistic concurrency, no rollback).

use crate::id::Id;
use crate::net::NodeHandle;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use std::sync::Arc;

/// Sort discipline relative to the owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Increasing circular distance in the successor direction.
    Ascending,
    /// Increasing circular distance in the predecessor direction.
    Descending,
    /// Insertion order; no coverage semantics.
    Unsorted,
}

/// An ordered sequence of node handles relative to an owning identifier.
pub struct NeighborList {
    name: &'static str,
    direction: Direction,
    base: Id,
    entries: Mutex<Vec<Arc<NodeHandle>>>,
    version: AtomicU64,
    stable: AtomicBool,
}

impl NeighborList {
    pub fn new(name: &'static str, direction: Direction, base: Id) -> Self {
        Self {
            name,
            direction,
            base,
            entries: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            stable: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn base(&self) -> &Id {
        &self.base
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<NodeHandle>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn bump(&self) {
        self.version.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Current mutation counter.
    pub fn version(&self) -> u64 {
        self.version.load(AtomicOrdering::SeqCst)
    }

    /// Whether the most recent sweep found no problems.
    pub fn stable(&self) -> bool {
        self.stable.load(AtomicOrdering::SeqCst)
    }

    pub fn set_stable(&self, stable: bool) {
        self.stable.store(stable, AtomicOrdering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Circular distance from the owner in this list's direction.
    pub fn distance(&self, id: &Id) -> Id {
        match self.direction {
            Direction::Ascending | Direction::Unsorted => id.sub(&self.base),
            Direction::Descending => self.base.sub(id),
        }
    }

    /// Entry at `index`; negative indices count from the tail.
    pub fn get(&self, index: isize) -> Option<Arc<NodeHandle>> {
        let entries = self.lock();
        let len = entries.len() as isize;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            return None;
        }
        Some(entries[index as usize].clone())
    }

    pub fn first(&self) -> Option<Arc<NodeHandle>> {
        self.get(0)
    }

    pub fn last(&self) -> Option<Arc<NodeHandle>> {
        self.get(-1)
    }

    pub fn snapshot(&self) -> Vec<Arc<NodeHandle>> {
        self.lock().clone()
    }

    /// Position of the handle (by endpoint), if present.
    pub fn position(&self, handle: &NodeHandle) -> Option<usize> {
        self.lock().iter().position(|e| **e == *handle)
    }

    pub fn contains(&self, handle: &NodeHandle) -> bool {
        self.position(handle).is_some()
    }

    pub fn find_by_addr(&self, addr: &str) -> Option<Arc<NodeHandle>> {
        self.lock().iter().find(|e| e.addr() == addr).cloned()
    }

    /// Inserts maintaining the direction invariant. Returns false without
    /// mutating if the identifier is already present.
    pub fn insert_sorted(&self, handle: Arc<NodeHandle>) -> bool {
        let mut entries = self.lock();
        self.insert_locked(&mut entries, handle)
    }

    /// Optimistically committing insert: applies only if the version still
    /// equals `expected` (snapshotted before an unlocked remote call).
    pub fn insert_if_version(&self, handle: Arc<NodeHandle>, expected: u64) -> bool {
        let mut entries = self.lock();
        if self.version() != expected {
            tracing::debug!(
                "{}: discarding stale insert of {} (version moved)",
                self.name,
                handle
            );
            return false;
        }
        self.insert_locked(&mut entries, handle)
    }

    fn insert_locked(&self, entries: &mut Vec<Arc<NodeHandle>>, handle: Arc<NodeHandle>) -> bool {
        if entries.iter().any(|e| e.id() == handle.id()) {
            return false;
        }
        let position = match self.direction {
            Direction::Unsorted => entries.len(),
            _ => {
                let d = self.distance(handle.id());
                entries
                    .iter()
                    .position(|e| self.distance(e.id()).compare(&d) == Ordering::Greater)
                    .unwrap_or(entries.len())
            }
        };
        entries.insert(position, handle);
        self.bump();
        true
    }

    /// Removes the handle (by endpoint). Returns whether anything changed.
    pub fn remove(&self, handle: &NodeHandle) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|e| **e == *handle) {
            Some(position) => {
                entries.remove(position);
                self.bump();
                true
            }
            None => false,
        }
    }

    /// Shrink-only truncation to at most `len` entries.
    pub fn crop(&self, len: usize) {
        let mut entries = self.lock();
        if entries.len() > len {
            entries.truncate(len);
            self.bump();
        }
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        if !entries.is_empty() {
            entries.clear();
            self.bump();
        }
        self.set_stable(false);
    }

    /// Coverage test: does this list's span contain `id`? A container with
    /// coverage base point `b` (ascending: the owner; descending: its own
    /// farthest-back entry) covers `id` iff `id` is neither `b` itself nor
    /// beyond the entry farthest from `b`.
    pub fn covers(&self, id: &Id) -> bool {
        let entries = self.lock();
        self.covers_locked(&entries, id)
    }

    fn coverage_base<'a>(&'a self, entries: &'a [Arc<NodeHandle>]) -> Option<&'a Id> {
        match self.direction {
            Direction::Ascending => Some(&self.base),
            Direction::Descending => entries.last().map(|e| e.id()),
            Direction::Unsorted => None,
        }
    }

    fn coverage_far<'a>(&self, entries: &'a [Arc<NodeHandle>]) -> Option<&'a Arc<NodeHandle>> {
        match self.direction {
            Direction::Ascending => entries.last(),
            Direction::Descending => entries.first(),
            Direction::Unsorted => None,
        }
    }

    fn covers_locked(&self, entries: &[Arc<NodeHandle>], id: &Id) -> bool {
        let (base, far) = match (self.coverage_base(entries), self.coverage_far(entries)) {
            (Some(b), Some(f)) => (b, f),
            _ => return false,
        };
        let d = id.sub(base);
        !d.is_zero() && d.compare(&far.id().sub(base)) != Ordering::Greater
    }

    /// The entry responsible for `id` under this list's coverage: the nearest
    /// entry at or beyond `id` in ring order from the coverage base (each
    /// entry owns the interval from its nearer neighbor exclusive to itself
    /// inclusive). `None` when `id` is outside the covered span.
    pub fn owner_of(&self, id: &Id) -> Option<Arc<NodeHandle>> {
        let entries = self.lock();
        if !self.covers_locked(&entries, id) {
            return None;
        }
        let base = self.coverage_base(&entries)?;
        let d = id.sub(base);
        let candidate = |e: &&Arc<NodeHandle>| e.id().sub(base).compare(&d) != Ordering::Less;
        match self.direction {
            Direction::Ascending => entries.iter().find(candidate).cloned(),
            Direction::Descending => entries.iter().rev().find(candidate).cloned(),
            Direction::Unsorted => None,
        }
    }
}

impl std::fmt::Debug for NeighborList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.lock();
        write!(f, "{}[", self.name)?;
        for (i, e) in entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "] v{}", self.version())
    }
}
