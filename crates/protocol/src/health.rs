//! Health probe payload shared by the broker and its supervisor.

use serde::{Deserialize, Serialize};

/// Value of [`HealthSnapshot::status`] for a live broker.
pub const STATUS_OK: &str = "ok";

/// Response body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Always `"ok"` when the broker answers.
    pub status: String,
    /// Number of live PTY sessions.
    pub terminals: usize,
    /// Platform identifier, e.g. `linux`.
    pub platform: String,
    /// Seconds since the broker started.
    pub uptime: f64,
    /// Process memory usage.
    pub memory: MemoryUsage,
}

impl HealthSnapshot {
    /// Whether the snapshot reports a healthy broker.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Memory usage of the broker process, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Resident set size.
    pub rss: u64,
    /// Virtual memory size.
    #[serde(rename = "virtual")]
    pub virtual_size: u64,
}
