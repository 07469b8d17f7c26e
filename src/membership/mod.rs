//! Ring Membership Protocol
//!
//! Atomic join and leave over a two-phase handshake, so the ring never shows
//! a half-linked node in one direction only.
//!
//! ## Core Mechanisms
//! - **Join**: a joiner asks the owner of its identifier to become its
//!   predecessor-side master; the master links its own successor (the
//!   delegate) to the joiner first, and commits its own link only after the
//!   joiner confirms.
//! - **Leave**: a leaver hands its departure to its predecessor, which
//!   splices the ring shut by coordinating with the node after the leaver.
//! - **Side Guards**: each direction admits one transaction at a time;
//!   concurrent attempts are answered with retryable aborts.

pub mod handlers;
pub mod service;
pub mod types;

pub use service::Membership;
pub use types::{AbortReason, AckKind, Outcome};

#[cfg(test)]
mod tests;
