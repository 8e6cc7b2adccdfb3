//! Replication pipeline configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Tunables for the signal → command → dispatch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Hours a never-dispatched command stays eligible before it expires
    pub command_ttl_hours: i64,

    /// Maximum commands returned by one dispatch pull
    pub dispatch_batch_limit: usize,

    /// Delay before the single read-after-write retry on a dispatch pull
    pub read_retry_delay_ms: u64,

    /// How long after an enqueue a missing command counts as a stale read
    pub read_hint_window_ms: u64,

    /// Interval of the maintenance sweep (seconds)
    pub sweep_interval_secs: u64,

    /// Silence after which an account is marked offline (seconds)
    pub offline_after_secs: i64,

    /// Age after which a still-pending signal is re-run through fanout (seconds)
    pub pending_signal_retry_secs: i64,

    /// Address the HTTP endpoint binds to
    pub listen_addr: String,

    /// Webhook receiving status events; disabled when unset
    pub notify_url: Option<String>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            command_ttl_hours: 24,
            dispatch_batch_limit: 50,
            read_retry_delay_ms: 250,
            read_hint_window_ms: 2_000,
            sweep_interval_secs: 30,
            offline_after_secs: 90,
            pending_signal_retry_secs: 30,
            listen_addr: "127.0.0.1:8080".to_string(),
            notify_url: None,
        }
    }
}

impl ReplicatorConfig {
    pub fn command_ttl(&self) -> Duration {
        Duration::hours(self.command_ttl_hours)
    }

    pub fn read_retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn read_hint_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.read_hint_window_ms)
    }
}
