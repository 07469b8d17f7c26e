//! Node Configuration
//!
//! One immutable configuration value, constructed once at startup (from a
//! JSON file or `Default`) and passed by reference into each component's
//! constructor. No component reads process-wide mutable state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Tuning knobs for a ring node. All durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Deadline for a single request/reply round trip.
    pub msg_timeout_ms: u64,
    /// Overall deadline for one key lookup, across all retries.
    pub lookup_timeout_ms: u64,
    /// Default iteration mode when a lookup query carries none
    /// (one of `unsafe`, `safe`, `neighbor`, `self`, `no_neighbor`, `no_safe`).
    pub lookup_iter_mode: String,
    /// Per-message deadline inside the connect handshake.
    pub connect_msg_timeout_ms: u64,
    /// Overall deadline for `connect`.
    pub connect_timeout_ms: u64,
    /// Deadline for the nested join_pred exchange with the delegate.
    pub joinpred_timeout_ms: u64,
    /// Age after which a table entry is considered stale and gets probed.
    pub alive_timeout_ms: u64,
    /// Deadline for a single ping round trip.
    pub ping_timeout_ms: u64,
    /// Ping attempts before an entry is declared dead.
    pub ping_retry_count: u32,
    /// Protected successor/predecessor prefix that is never rebalanced away.
    pub min_succ: usize,
    /// Fraction of entries beyond `min_succ` kept as neighbors rather than
    /// converted to fingers.
    pub succ_ratio: f64,
    /// Period of the cheap liveness-only stabilizer pass.
    pub concurrent_cycle_ms: u64,
    /// Period of the structural repair-and-rebalance stabilizer pass.
    pub backoff_cycle_ms: u64,
    /// Bound on the rebalance grow/test/adjust iterations per pass.
    pub rebalance_max_iter: usize,
    /// Period of the liveness gossip exchange.
    pub gossip_cycle_ms: u64,
    /// Silence threshold after which an immediate neighbor is reported for a
    /// leave check.
    pub gossip_leave_timeout_ms: u64,
    /// Depth of each service's inbound message queue; messages beyond it are
    /// dropped (backpressure).
    pub service_queue_depth: usize,
    /// Concurrent handler tasks per service.
    pub service_worker_count: usize,
    /// Largest datagram accepted or produced.
    pub max_packet_size: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            msg_timeout_ms: 1_000,
            lookup_timeout_ms: 5_000,
            lookup_iter_mode: "no_safe".to_string(),
            connect_msg_timeout_ms: 1_000,
            connect_timeout_ms: 10_000,
            joinpred_timeout_ms: 3_000,
            alive_timeout_ms: 10_000,
            ping_timeout_ms: 500,
            ping_retry_count: 3,
            min_succ: 3,
            succ_ratio: 0.5,
            concurrent_cycle_ms: 2_000,
            backoff_cycle_ms: 30_000,
            rebalance_max_iter: 8,
            gossip_cycle_ms: 2_000,
            gossip_leave_timeout_ms: 8_000,
            service_queue_depth: 256,
            service_worker_count: 8,
            max_packet_size: 8_192,
        }
    }
}

impl RingConfig {
    /// Loads a configuration from a JSON file. Missing fields fall back to
    /// their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn connect_msg_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_msg_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn joinpred_timeout(&self) -> Duration {
        Duration::from_millis(self.joinpred_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn concurrent_cycle(&self) -> Duration {
        Duration::from_millis(self.concurrent_cycle_ms)
    }

    pub fn backoff_cycle(&self) -> Duration {
        Duration::from_millis(self.backoff_cycle_ms)
    }

    pub fn gossip_cycle(&self) -> Duration {
        Duration::from_millis(self.gossip_cycle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_consistent() {
        let config = RingConfig::default();
        assert_eq!(config.min_succ, 3);
        assert!(config.succ_ratio > 0.0 && config.succ_ratio <= 1.0);
        assert!(config.msg_timeout_ms <= config.lookup_timeout_ms);
        assert!(config.concurrent_cycle_ms <= config.backoff_cycle_ms);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: RingConfig =
            serde_json::from_str(r#"{ "min_succ": 5, "succ_ratio": 0.25 }"#).unwrap();
        assert_eq!(config.min_succ, 5);
        assert_eq!(config.succ_ratio, 0.25);
        assert_eq!(config.msg_timeout_ms, RingConfig::default().msg_timeout_ms);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let result: Result<RingConfig, _> = serde_json::from_str("{ not json");
        assert!(result.is_err());
    }
}
