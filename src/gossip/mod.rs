//! Liveness Gossip
//!
//! Each cycle a node pushes a version-tagged snapshot of its successor list
//! to its first predecessor and of its predecessor list to its first
//! successor. Receivers merge the snapshot into their own same-direction
//! list, bounded by what they already reach, and prune entries the neighbor
//! no longer sees. A primary neighbor that stays silent past the leave
//! timeout is handed to the membership service for an advisory leave check.

pub mod handlers;
pub mod service;

pub use service::Gossip;
