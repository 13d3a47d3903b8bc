//! `GET /health` endpoint.
//!
//! Read-only over the session registry; answers while sessions are being
//! created or torn down.

use axum::extract::State;
use axum::response::Json;
use protocol::{HealthSnapshot, MemoryUsage, STATUS_OK};

use crate::server::AppState;

/// Health handler.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(snapshot(&state))
}

/// Builds the current health snapshot.
pub fn snapshot(state: &AppState) -> HealthSnapshot {
    HealthSnapshot {
        status: STATUS_OK.to_string(),
        terminals: state.manager.count(),
        platform: std::env::consts::OS.to_string(),
        uptime: state.started_at.elapsed().as_secs_f64(),
        memory: memory_usage(),
    }
}

/// Memory usage of this process. Zero where `/proc` is unavailable.
pub fn memory_usage() -> MemoryUsage {
    std::fs::read_to_string("/proc/self/status")
        .map(|status| parse_proc_status(&status))
        .unwrap_or_default()
}

/// Extracts `VmRSS` and `VmSize` (reported in kB) from `/proc/<pid>/status`.
pub fn parse_proc_status(status: &str) -> MemoryUsage {
    let mut usage = MemoryUsage::default();
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let kb = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        match key {
            "VmRSS" => usage.rss = kb * 1024,
            "VmSize" => usage.virtual_size = kb * 1024,
            _ => {}
        }
    }
    usage
}
