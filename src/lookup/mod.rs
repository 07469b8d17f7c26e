//! Lookup / Routing Protocol
//!
//! Resolves "which node owns identifier X" across the ring. The client side
//! runs a small send/wait state machine over a candidate stack, retrying
//! through better-informed pointers until some node answers authoritatively.
//! The server side classifies its own relation to the locally computed owner
//! and either answers or forwards, according to the caller's iteration mode.
//!
//! Also carries the table-reference query protocol used by the stabilizer
//! and the membership handshakes to read a remote node's neighbor tables.

pub mod handlers;
pub mod service;
pub mod types;

pub use service::Lookup;
pub use types::{AtomicQuery, Classification, IterMode, LookupError, QueryResult};

#[cfg(test)]
mod tests;
