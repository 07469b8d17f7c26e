//! Chord-style Overlay Maintenance and Routing Core
//!
//! This library crate defines the core modules of a structured peer-to-peer
//! overlay: nodes arrange themselves on a circular identifier space, maintain
//! neighbor tables, and route key lookups toward the node responsible for a
//! given identifier. It serves as the foundation for the binary executable
//! (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of the following loosely coupled subsystems:
//!
//! - **`id`**: The circular identifier space. Fixed-length big-endian
//!   identifiers with modular arithmetic, half-open circular intervals, and a
//!   pluggable hash factory (SHA-1 by default).
//! - **`net`**: The datagram transport. A UDP message socket with a text-line
//!   wire codec, ticket-multiplexed request/reply conversations, named-service
//!   dispatch through bounded worker queues, and a ping probe.
//! - **`tables`**: The neighbor tables. One generic direction-parameterized
//!   list (predecessor, successor, finger disciplines), the stabilization
//!   phases operating on them, and the routing aggregate that resolves
//!   "who owns identifier X".
//! - **`lookup`**: The lookup/routing protocol. Client-side iterative lookup
//!   with a candidate stack, server-side responsibility classification, and
//!   compound table-reference queries.
//! - **`membership`**: The join/leave coordination layer. Distributed
//!   two-phase transactions that keep ring links consistent in both
//!   directions.
//! - **`stabilizer`**: Periodic repair and size rebalancing driven by
//!   counting/correctness rules.
//! - **`gossip`**: Liveness heartbeats. Version-tagged neighbor-list exchange
//!   with immediate neighbors, detecting silent nodes.
//! - **`node`**: The facade wiring everything together into a running ring
//!   node.

pub mod config;
pub mod gossip;
pub mod id;
pub mod lookup;
pub mod membership;
pub mod net;
pub mod node;
pub mod stabilizer;
pub mod tables;
