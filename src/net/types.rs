//! Node handles: how peers are referenced throughout the tables.

use crate::id::{Id, IdFactory};
use anyhow::{anyhow, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A remote (or the local) node: network endpoint, ring identifier, and the
/// time of the last observed contact.
///
/// Endpoint and identifier are fixed at construction; the timestamp is
/// touched on every observed contact. Handles are shared as
/// `Arc<NodeHandle>` across all tables holding them, so one touch refreshes
/// every table. Equality, ordering, and hashing go by endpoint only.
pub struct NodeHandle {
    host: String,
    port: u16,
    id: Id,
    last_seen_ms: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl NodeHandle {
    pub fn new(host: impl Into<String>, port: u16, id: Id) -> Self {
        Self {
            host: host.into(),
            port,
            id,
            last_seen_ms: AtomicU64::new(now_ms()),
        }
    }

    /// Builds a handle from a `"host:port"` string, hashing the canonical
    /// numeric form for the identifier. Hostnames are resolved up front:
    /// reply routing and handle equality compare endpoints as text, so two
    /// spellings of one endpoint must not coexist.
    pub fn from_addr(addr: &str, factory: &dyn IdFactory) -> Result<Self> {
        let (host, port) = split_addr(addr)?;
        let host = resolve_host(&host, port)?;
        let id = factory.hash(format!("{host}:{port}").as_bytes());
        Ok(Self::new(host, port, id))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The canonical `"host:port"` wire form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Records an observed contact now.
    pub fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since the last observed contact.
    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_seen_ms.load(Ordering::Relaxed))
    }
}

/// Numeric hosts pass through; anything else goes through the system
/// resolver once, at construction.
fn resolve_host(host: &str, port: u16) -> Result<String> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    let resolved = (host, port)
        .to_socket_addrs()
        .map_err(|e| anyhow!("bad address {host:?}: {e}"))?
        .next()
        .ok_or_else(|| anyhow!("bad address {host:?}: no address records"))?;
    Ok(resolved.ip().to_string())
}

/// Splits `"host:port"`, accepting any non-empty host part.
pub fn split_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("bad address {addr:?}: missing port"))?;
    if host.is_empty() {
        return Err(anyhow!("bad address {addr:?}: empty host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("bad address {addr:?}: bad port"))?;
    Ok((host.to_string(), port))
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({}:{} {:?})", self.host, self.port, self.id)
    }
}
