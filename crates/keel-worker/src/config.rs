//! Worker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stable worker identity, recorded on claimed runs.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Ordinary slots for tool handlers.
    #[serde(default = "default_slots")]
    pub slots: usize,

    /// Durable slots for agent handlers. Agents spend most of their life
    /// suspended, so this pool is sized larger.
    #[serde(default = "default_durable_slots")]
    pub durable_slots: usize,

    /// Queue poll interval in milliseconds when idle.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Claim lease duration in seconds.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Wake-up service tick interval in milliseconds.
    #[serde(default = "default_wakeup_interval_ms")]
    pub wakeup_interval_ms: u64,
}

fn default_worker_id() -> String {
    format!("keel-worker-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

fn default_slots() -> usize {
    8
}

fn default_durable_slots() -> usize {
    32
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_lease_secs() -> u64 {
    30
}

fn default_wakeup_interval_ms() -> u64 {
    100
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            slots: default_slots(),
            durable_slots: default_durable_slots(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            wakeup_interval_ms: default_wakeup_interval_ms(),
        }
    }
}

impl WorkerConfig {
    /// Queue poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Claim lease duration.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Wake-up tick interval.
    pub fn wakeup_interval(&self) -> Duration {
        Duration::from_millis(self.wakeup_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.slots, 8);
        assert_eq!(config.durable_slots, 32);
        assert!(config.worker_id.starts_with("keel-worker-"));
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: WorkerConfig = serde_json::from_str(r#"{"slots": 2}"#).unwrap();
        assert_eq!(config.slots, 2);
        assert_eq!(config.durable_slots, 32);
        assert_eq!(config.poll_interval_ms, 100);
    }
}
