//! Lookup protocol vocabulary: iteration modes, owner classifications, and
//! table query decomposition.

use thiserror::Error;

/// Result placeholder for a table reference that resolved to nothing.
pub const NOT_FOUND: &str = "not_found";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup timed out")]
    Timeout,
    #[error("invalid lookup argument: {0}")]
    InvalidArgument(String),
    #[error("out of conversation tickets")]
    Exhausted,
}

/// The caller's policy for how authoritative an answer must be before a node
/// may reply instead of forwarding. Looser modes trade staleness risk for
/// fewer hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterMode {
    /// Any node may answer.
    Unsafe,
    /// Only safe nodes, neighbors of the owner, or the owner itself.
    Safe,
    /// Only neighbors of the owner or the owner itself.
    Neighbor,
    /// Only the owner itself.
    SelfOnly,
    /// Skip the neighbor shortcut but accept safe and unsafe answers.
    NoNeighbor,
    /// Accept only fully unvalidated local answers or the owner itself.
    NoSafe,
}

impl IterMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "unsafe" => Some(Self::Unsafe),
            "safe" => Some(Self::Safe),
            "neighbor" => Some(Self::Neighbor),
            "self" => Some(Self::SelfOnly),
            "no_neighbor" => Some(Self::NoNeighbor),
            "no_safe" => Some(Self::NoSafe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsafe => "unsafe",
            Self::Safe => "safe",
            Self::Neighbor => "neighbor",
            Self::SelfOnly => "self",
            Self::NoNeighbor => "no_neighbor",
            Self::NoSafe => "no_safe",
        }
    }
}

/// A serving node's relation to the owner it computed for a queried
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The serving node is the owner.
    SelfOwned,
    /// The owner is the serving node's immediate predecessor or successor.
    Neighbor,
    /// The owner passes the serving node's safety test.
    Safe,
    /// Anything else: the answer may be stale.
    Unsafe,
}

impl Classification {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "self" => Some(Self::SelfOwned),
            "neighbor" => Some(Self::Neighbor),
            "safe" => Some(Self::Safe),
            "unsafe" => Some(Self::Unsafe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfOwned => "self",
            Self::Neighbor => "neighbor",
            Self::Safe => "safe",
            Self::Unsafe => "unsafe",
        }
    }

    /// The fixed compatibility table between a requested iteration mode and
    /// the local classification: may this node answer, or must it forward?
    pub fn answerable(self, mode: IterMode) -> bool {
        match self {
            Self::SelfOwned => true,
            Self::Neighbor => matches!(mode, IterMode::Neighbor | IterMode::Safe | IterMode::Unsafe),
            Self::Safe => matches!(mode, IterMode::Safe | IterMode::Unsafe | IterMode::NoNeighbor),
            Self::Unsafe => {
                matches!(mode, IterMode::Unsafe | IterMode::NoNeighbor | IterMode::NoSafe)
            }
        }
    }
}

/// One `(queryId, opId, "table:op")` unit of a compound table query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicQuery {
    pub query_id: usize,
    pub op_id: usize,
    pub reference: String,
}

/// Splits a compound query line (`"table1:op1:op2 table2:op3 ..."`) into
/// atomic queries. Client and server run the same decomposition so the ids
/// in reply lines agree.
pub fn decompose(query: &str) -> Result<Vec<AtomicQuery>, LookupError> {
    let mut out = Vec::new();
    for (query_id, group) in query.split_whitespace().enumerate() {
        let mut parts = group.split(':');
        let table = parts
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LookupError::InvalidArgument(format!("bad query group {group:?}")))?;
        let mut op_id = 0;
        for op in parts {
            if op.is_empty() {
                return Err(LookupError::InvalidArgument(format!(
                    "empty op in query group {group:?}"
                )));
            }
            out.push(AtomicQuery {
                query_id,
                op_id,
                reference: format!("{table}:{op}"),
            });
            op_id += 1;
        }
        if op_id == 0 {
            return Err(LookupError::InvalidArgument(format!(
                "query group {group:?} names no operation"
            )));
        }
    }
    Ok(out)
}

/// One reply line of a compound table query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub query_id: usize,
    pub op_id: usize,
    pub reference: String,
    /// The resolved value (`"host:port"` or a size), `None` for `not_found`.
    pub value: Option<String>,
}

impl QueryResult {
    /// Parses a `"queryId,opId table:op result"` reply line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let ids = fields.next()?;
        let reference = fields.next()?;
        let result = fields.next()?;
        if fields.next().is_some() {
            return None;
        }
        let (query_id, op_id) = ids.split_once(',')?;
        Some(Self {
            query_id: query_id.parse().ok()?,
            op_id: op_id.parse().ok()?,
            reference: reference.to_string(),
            value: (result != NOT_FOUND).then(|| result.to_string()),
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{},{} {} {}",
            self.query_id,
            self.op_id,
            self.reference,
            self.value.as_deref().unwrap_or(NOT_FOUND)
        )
    }
}
