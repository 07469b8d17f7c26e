//! Text-line wire codec.
//!
//! A datagram is UTF-8 text: one header line
//! `"<from_ticket> <to_ticket> <flags> <operation>"` followed by the body.
//! Bodies carry space-delimited `--flag value` options or structured reply
//! lines, depending on the operation. Identifiers travel base64-encoded;
//! node handles travel as `"host:port"`.

use anyhow::{anyhow, Result};
use std::fmt;

/// Operation names used across the overlay protocols.
pub mod ops {
    // Membership control.
    pub const JOIN: &str = "join";
    pub const JOIN_PRED: &str = "join_pred";
    pub const LEAVE: &str = "leave";
    pub const LEAVE_PRED: &str = "leave_pred";
    pub const READY: &str = "ready";
    pub const COMMIT: &str = "commit";
    pub const ACK: &str = "ack";
    pub const ABORT: &str = "abort";
    // Lookup.
    pub const INDEX: &str = "index";
    pub const INDEX_RES: &str = "index_res";
    pub const TABLE: &str = "table";
    pub const TABLE_RES: &str = "table_res";
    // Liveness gossip.
    pub const ALIVE: &str = "alive";
    // Transport probes.
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// Header flag bit: this message is a round-trip probe.
pub const FLAG_PING: u8 = 0x01;
/// Header flag bit: this message answers a probe.
pub const FLAG_PONG: u8 = 0x02;

/// One wire message. `from_ticket` names the sender's conversation slot a
/// reply should target; `to_ticket` routes this message into the receiver's
/// conversation slot (0 means unsolicited, dispatched by operation name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from_ticket: u8,
    pub to_ticket: u8,
    pub flags: u8,
    pub operation: String,
    pub body: String,
}

impl Message {
    /// An unsolicited request opening a conversation on `from_ticket`.
    pub fn request(operation: &str, from_ticket: u8, body: impl Into<String>) -> Self {
        Self {
            from_ticket,
            to_ticket: 0,
            flags: 0,
            operation: operation.to_string(),
            body: body.into(),
        }
    }

    /// A reply into the conversation the given message came from.
    pub fn reply_to(request: &Message, operation: &str, from_ticket: u8, body: impl Into<String>) -> Self {
        Self {
            from_ticket,
            to_ticket: request.from_ticket,
            flags: 0,
            operation: operation.to_string(),
            body: body.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {}\n{}",
            self.from_ticket, self.to_ticket, self.flags, self.operation, self.body
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let (header, body) = match text.split_once('\n') {
            Some((h, b)) => (h, b),
            None => (text, ""),
        };
        let mut fields = header.split_whitespace();
        let from_ticket = fields
            .next()
            .ok_or_else(|| anyhow!("empty header"))?
            .parse::<u8>()
            .map_err(|_| anyhow!("bad from_ticket"))?;
        let to_ticket = fields
            .next()
            .ok_or_else(|| anyhow!("missing to_ticket"))?
            .parse::<u8>()
            .map_err(|_| anyhow!("bad to_ticket"))?;
        let flags = fields
            .next()
            .ok_or_else(|| anyhow!("missing flags"))?
            .parse::<u8>()
            .map_err(|_| anyhow!("bad flags"))?;
        let operation = fields
            .next()
            .ok_or_else(|| anyhow!("missing operation"))?
            .to_string();
        if fields.next().is_some() {
            return Err(anyhow!("trailing junk in header"));
        }
        Ok(Self {
            from_ticket,
            to_ticket,
            flags,
            operation,
            body: body.to_string(),
        })
    }

    pub fn is_ping(&self) -> bool {
        self.flags & FLAG_PING != 0
    }

    pub fn is_pong(&self) -> bool {
        self.flags & FLAG_PONG != 0
    }

    /// First value of a `--name value` option in the body, if present.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options(name).into_iter().next()
    }

    /// All values of a repeatable `--name value` option, in body order.
    pub fn options(&self, name: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut tokens = self.body.split_whitespace().peekable();
        while let Some(tok) = tokens.next() {
            if let Some(flag) = tok.strip_prefix("--") {
                if flag == name {
                    if let Some(value) = tokens.peek() {
                        if !value.starts_with("--") {
                            out.push(*value);
                            tokens.next();
                            continue;
                        }
                    }
                    // Bare flag: present without a value.
                    out.push("");
                }
            }
        }
        out
    }

    /// True when the bare flag `--name` appears in the body (with or without
    /// a value).
    pub fn has_option(&self, name: &str) -> bool {
        !self.options(name).is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}->{}]",
            self.operation, self.from_ticket, self.to_ticket
        )
    }
}
