//! Datagram Transport
//!
//! UDP message plumbing for the overlay protocols: a text-line wire codec,
//! a message socket multiplexing request/reply conversations over a bounded
//! ticket namespace, named-service dispatch through bounded worker queues,
//! and an unreliable ping probe.
//!
//! Delivery is unreliable, at-least-once, and unordered; every protocol
//! built on top owns its own retries and deadlines.

pub mod message;
pub mod socket;
pub mod types;

pub use message::{ops, Message};
pub use socket::{spawn_workers, Envelope, MessageSocket, RecvTimeout, Ticket, TicketError};
pub use types::NodeHandle;
