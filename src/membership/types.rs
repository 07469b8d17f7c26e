//! Membership transaction vocabulary: outcome signals and the per-side
//! mutual-exclusion guards.

use crate::net::message::{ops, Message};
use std::fmt;
use std::sync::Mutex;

/// Why a membership transaction was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Another join/leave already runs on this side.
    ConcurrentConflict,
    /// Two distinct endpoints hash to the same identifier; unrecoverable.
    IndexCollision,
    /// The peer does not belong at this position of the ring.
    WrongHost,
    /// The counterparty stopped answering inside the transaction.
    Timeout,
    /// A local invariant failed mid-transaction.
    Internal,
    /// A nested exchange aborted and the failure propagates outward.
    Cascading,
}

impl AbortReason {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "concurrent_conflict" => Some(Self::ConcurrentConflict),
            "index_collision" => Some(Self::IndexCollision),
            "wrong_host" => Some(Self::WrongHost),
            "timeout" => Some(Self::Timeout),
            "internal" => Some(Self::Internal),
            "cascading" => Some(Self::Cascading),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConcurrentConflict => "concurrent_conflict",
            Self::IndexCollision => "index_collision",
            Self::WrongHost => "wrong_host",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
            Self::Cascading => "cascading",
        }
    }
}

/// What an acknowledgment asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// The request is satisfied (possibly already was).
    Confirm,
    /// The same transaction is already running; wait, then retry.
    Initiated,
    /// An advisory leave check found the peer still serving its tables.
    TableSafe,
}

impl AckKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "confirm" => Some(Self::Confirm),
            "initiated" => Some(Self::Initiated),
            "table_safe" => Some(Self::TableSafe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Initiated => "initiated",
            Self::TableSafe => "table_safe",
        }
    }
}

/// The outcome signals of a membership transaction step, carried as explicit
/// values up the call chain. The payload holds the step's `--flag value`
/// options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ack(AckKind, String),
    Abort(AbortReason, String),
    Commit(String),
}

impl Outcome {
    pub fn abort(reason: AbortReason) -> Self {
        Self::Abort(reason, String::new())
    }

    pub fn ack(kind: AckKind) -> Self {
        Self::Ack(kind, String::new())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Commit(_) | Self::Ack(_, _))
    }

    /// Wire form, replying into the conversation `request` came from.
    pub fn to_reply(&self, request: &Message, from_ticket: u8) -> Message {
        match self {
            Self::Ack(kind, payload) => Message::reply_to(
                request,
                ops::ACK,
                from_ticket,
                join_payload(&format!("--msg {}", kind.as_str()), payload),
            ),
            Self::Abort(reason, payload) => Message::reply_to(
                request,
                ops::ABORT,
                from_ticket,
                join_payload(&format!("--reason {}", reason.as_str()), payload),
            ),
            Self::Commit(payload) => {
                Message::reply_to(request, ops::COMMIT, from_ticket, payload.clone())
            }
        }
    }

    /// Parses an inbound `ack`/`abort`/`commit`. Unknown kinds and reasons
    /// are `None`; the caller logs and drops them.
    pub fn from_message(msg: &Message) -> Option<Self> {
        match msg.operation.as_str() {
            ops::ACK => {
                let kind = AckKind::parse(msg.option("msg")?)?;
                Some(Self::Ack(kind, msg.body.clone()))
            }
            ops::ABORT => {
                let reason = AbortReason::parse(msg.option("reason")?)?;
                Some(Self::Abort(reason, msg.body.clone()))
            }
            ops::COMMIT => Some(Self::Commit(msg.body.clone())),
            _ => None,
        }
    }
}

/// Extracts a `--name value` option from an outcome payload.
pub fn payload_option<'a>(payload: &'a str, name: &str) -> Option<&'a str> {
    let flag = format!("--{name}");
    let mut tokens = payload.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == flag {
            return tokens.next();
        }
    }
    None
}

fn join_payload(head: &str, payload: &str) -> String {
    if payload.is_empty() {
        head.to_string()
    } else {
        format!("{head} {payload}")
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack(kind, _) => write!(f, "ack({})", kind.as_str()),
            Self::Abort(reason, _) => write!(f, "abort({})", reason.as_str()),
            Self::Commit(_) => write!(f, "commit"),
        }
    }
}

/// The operation kinds a side guard distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Join,
    JoinPred,
    Leave,
    LeavePred,
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Claim {
    peer: String,
    op: Op,
}

/// Result of trying to claim one ring side for a transaction.
#[derive(Debug)]
pub enum ClaimOutcome<'a> {
    /// The side is ours until the guard drops.
    Acquired(ClaimGuard<'a>),
    /// The identical peer+operation already runs; answer `Ack(Initiated)`.
    AlreadyInitiated,
    /// A different transaction holds the side; answer
    /// `Abort(ConcurrentConflict)`.
    Busy,
}

/// Mutual exclusion for one ring direction: at most one join/leave
/// transaction per side at a time.
pub struct SideGuard {
    name: &'static str,
    claim: Mutex<Option<Claim>>,
}

impl SideGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            claim: Mutex::new(None),
        }
    }

    pub fn try_claim(&self, peer: &str, op: Op) -> ClaimOutcome<'_> {
        let mut claim = match self.claim.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match claim.as_ref() {
            None => {
                *claim = Some(Claim {
                    peer: peer.to_string(),
                    op,
                });
                ClaimOutcome::Acquired(ClaimGuard { owner: self })
            }
            Some(active) if active.peer == peer && active.op == op => {
                tracing::debug!("{} side: {:?} by {} already running", self.name, op, peer);
                ClaimOutcome::AlreadyInitiated
            }
            Some(active) => {
                tracing::debug!(
                    "{} side: {:?} by {} conflicts with {:?} by {}",
                    self.name,
                    op,
                    peer,
                    active.op,
                    active.peer
                );
                ClaimOutcome::Busy
            }
        }
    }

    fn release(&self) {
        let mut claim = match self.claim.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *claim = None;
    }
}

impl fmt::Debug for SideGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SideGuard({})", self.name)
    }
}

/// Releases the side claim on drop.
#[derive(Debug)]
pub struct ClaimGuard<'a> {
    owner: &'a SideGuard,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.owner.release();
    }
}
