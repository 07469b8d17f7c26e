//! Ring Stabilizer
//!
//! Keeps the three neighbor containers sized and truthful as the ring
//! changes underneath us.
//!
//! ## Core Mechanisms
//! - **Two-tier cadence**: a cheap liveness sweep every concurrent cycle,
//!   and the full repair + rebalance pass on the backoff cycle or
//!   immediately whenever any container is marked unstable.
//! - **Sizing policy**: an estimated ring size `n` splits into a neighbor
//!   count and a finger count; the successor and predecessor lists carry the
//!   near field, fingers carry the far field.
//! - **Rebalance search**: grow the containers to the candidate shape, test
//!   it for redundancy and completeness, and walk `n` up or down until the
//!   shape closes the ring exactly.

pub mod service;

pub use service::{finger_count, neighbor_count, Balance, Stabilizer};

#[cfg(test)]
mod tests;
