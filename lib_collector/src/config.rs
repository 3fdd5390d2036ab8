//! # Engine Configuration
//!
//! Every tunable of the engine lives in [`EngineConfig`]. All fields carry a
//! default so a partial JSON document (or none at all) yields a runnable
//! configuration; the `servers` crate layers CLI and environment values on top.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::catch_up::CatchUpPolicy;

/// Runtime parameters shared by every engine component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the upstream station registry.
    pub registry_url: String,
    /// Optional bearer token for the registry.
    pub registry_token: Option<String>,
    /// Name this collector reports itself as.
    pub server_name: String,
    /// Number of collection process groups.
    pub processes: usize,
    /// Worker slots per process group.
    pub slots_per_process: usize,
    /// Logical storage slots driven by the persistence pipeline.
    pub persistence_slots: usize,
    /// Storage backend name handed to the storage factory.
    pub storage_backend: String,

    pub connect_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub close_timeout_seconds: u64,
    pub storage_connect_timeout_seconds: u64,
    pub save_timeout_seconds: u64,
    pub storage_op_timeout_seconds: u64,
    pub liveness_limit_seconds: u64,
    pub watchdog_interval_seconds: u64,
    pub watchdog_limit_seconds: u64,
    pub watchdog_close_attempts: usize,
    pub sync_interval_seconds: u64,
    pub assignment_interval_seconds: u64,
    pub log_flush_interval_seconds: u64,
    pub log_batch_size: usize,
    /// Pause after a failed client creation or an idle slot turn.
    pub retry_pause_ms: u64,

    /// Capacity of the per-station latency ring buffer.
    pub ring_buffer_size: usize,
    /// Records between two progress messages (collection and persistence).
    pub progress_every: usize,
    /// Rows that failed twice kept in memory before the oldest are dropped.
    pub abandoned_limit: usize,
    pub catch_up: CatchUpPolicy,

    /// Pause between two registry fetches after a non-200 answer.
    pub registry_backoff_ms: u64,
    /// Attempts per fetch inside the sync loop.
    pub registry_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://localhost:8000/".to_string(),
            registry_token: None,
            server_name: "collector".to_string(),
            processes: 1,
            slots_per_process: 4,
            persistence_slots: 24,
            storage_backend: "MEMORY".to_string(),
            connect_timeout_seconds: 30,
            read_timeout_seconds: 10,
            heartbeat_timeout_seconds: 5,
            close_timeout_seconds: 5,
            storage_connect_timeout_seconds: 20,
            save_timeout_seconds: 15,
            storage_op_timeout_seconds: 10,
            liveness_limit_seconds: 60,
            watchdog_interval_seconds: 5,
            watchdog_limit_seconds: 60,
            watchdog_close_attempts: 5,
            sync_interval_seconds: 30,
            assignment_interval_seconds: 1,
            log_flush_interval_seconds: 5,
            log_batch_size: 256,
            retry_pause_ms: 1000,
            ring_buffer_size: 7200,
            progress_every: 60,
            abandoned_limit: 10_000,
            catch_up: CatchUpPolicy::default(),
            registry_backoff_ms: 500,
            registry_max_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Total number of collection worker slots.
    pub fn worker_slots(&self) -> usize {
        self.processes * self.slots_per_process
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_seconds)
    }

    pub fn storage_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_connect_timeout_seconds)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_secs(self.save_timeout_seconds)
    }

    pub fn storage_op_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_op_timeout_seconds)
    }

    pub fn liveness_limit(&self) -> Duration {
        Duration::from_secs(self.liveness_limit_seconds)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_seconds)
    }

    pub fn watchdog_limit(&self) -> Duration {
        Duration::from_secs(self.watchdog_limit_seconds)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn assignment_interval(&self) -> Duration {
        Duration::from_secs(self.assignment_interval_seconds)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_secs(self.log_flush_interval_seconds)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn registry_backoff(&self) -> Duration {
        Duration::from_millis(self.registry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.save_timeout(), Duration::from_secs(15));
        assert_eq!(config.persistence_slots, 24);
        assert_eq!(config.ring_buffer_size, 7200);
        assert_eq!(config.catch_up.max_reads, 120);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "processes": 3, "slots_per_process": 2, "catch_up": { "mu": 0.25 } }"#,
        )
        .unwrap();

        assert_eq!(config.worker_slots(), 6);
        assert_eq!(config.catch_up.mu, 0.25);
        assert_eq!(config.catch_up.factor, 0.8);
        assert_eq!(config.watchdog_limit_seconds, 60);
    }
}
