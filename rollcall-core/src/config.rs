//! Engine configuration. Every field has a default so a partial TOML table is enough.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::admission::{
    DEFAULT_CONNECTION_OVERHEAD_SECS, DEFAULT_MAX_CONNECTIONS, DEFAULT_PER_PEER_PROCESSING_SECS,
};
use crate::protocol::MAX_PAYLOAD_BYTES;
use crate::retry::DEFAULT_MAX_RETRIES;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Concurrent link ceiling (default 5, at least 1).
    #[serde(
        default = "default_max_connections",
        deserialize_with = "at_least_one_connection"
    )]
    pub max_connections: usize,
    /// Retransmissions before a message is dropped (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff table in ms; the last entry repeats (default 1000, 2000, 4000).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: Vec<u64>,
    #[serde(default = "default_per_peer_processing_secs")]
    pub per_peer_processing_secs: u64,
    #[serde(default = "default_connection_overhead_secs")]
    pub connection_overhead_secs: u64,
    /// Pause between a completed exchange and releasing the link (default 2000).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Link-up to services discovered (default 6000).
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Services discovered to attendance received (default 15000).
    #[serde(default = "default_data_timeout_ms")]
    pub data_timeout_ms: u64,
    /// How long a slot is held for a dequeued peer to reconnect (default 30000).
    #[serde(default = "default_reservation_timeout_ms")]
    pub reservation_timeout_ms: u64,
    /// Slack past the quoted wait before a queued peer that never came back is dropped
    /// (default 10000).
    #[serde(default = "default_queue_grace_ms")]
    pub queue_grace_ms: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Roll-number prefixes that get the queue fast-track bonus.
    #[serde(default)]
    pub fast_track_prefixes: Vec<String>,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_backoff_ms() -> Vec<u64> {
    vec![1000, 2000, 4000]
}
fn default_per_peer_processing_secs() -> u64 {
    DEFAULT_PER_PEER_PROCESSING_SECS
}
fn default_connection_overhead_secs() -> u64 {
    DEFAULT_CONNECTION_OVERHEAD_SECS
}
fn default_settle_delay_ms() -> u64 {
    2000
}
fn default_discovery_timeout_ms() -> u64 {
    6000
}
fn default_data_timeout_ms() -> u64 {
    15000
}
fn default_reservation_timeout_ms() -> u64 {
    30000
}
fn default_queue_grace_ms() -> u64 {
    10000
}
fn default_max_payload_bytes() -> usize {
    MAX_PAYLOAD_BYTES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            per_peer_processing_secs: default_per_peer_processing_secs(),
            connection_overhead_secs: default_connection_overhead_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            data_timeout_ms: default_data_timeout_ms(),
            reservation_timeout_ms: default_reservation_timeout_ms(),
            queue_grace_ms: default_queue_grace_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            fast_track_prefixes: Vec::new(),
        }
    }
}

fn at_least_one_connection<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
    let n = usize::deserialize(d)?;
    if n == 0 {
        return Err(serde::de::Error::custom("max_connections must be at least 1"));
    }
    Ok(n)
}

impl EngineConfig {
    pub fn retry_backoff(&self) -> Vec<Duration> {
        self.retry_backoff_ms
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect()
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    pub fn queue_grace(&self) -> Duration {
        Duration::from_millis(self.queue_grace_ms)
    }
}
