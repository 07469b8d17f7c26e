//! Neighbor Tables
//!
//! The three ordered containers every node maintains (predecessor list,
//! successor list, finger table), implemented as one generic
//! direction-parameterized list, plus the stabilization phases operating on
//! them and the routing aggregate that resolves ownership queries across all
//! three.

pub mod list;
pub mod routing;
pub mod stabilize;

pub use list::{Direction, NeighborList};
pub use routing::RoutingTable;
