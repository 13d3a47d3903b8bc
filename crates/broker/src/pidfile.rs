//! PID file utilities for broker running detection.
//!
//! ## PID File Location
//!
//! - `$XDG_DATA_HOME/termbridge/broker.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/termbridge/broker.pid` otherwise
//!
//! ## Example
//!
//! ```rust
//! use broker::pidfile::{get_broker_pid, is_broker_running};
//!
//! if is_broker_running() {
//!     if let Some(pid) = get_broker_pid() {
//!         println!("Broker is already running with PID {}", pid);
//!     }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Get the path to the broker PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("termbridge").join("broker.pid")
}

/// Check if a broker process is currently running.
///
/// Cleans up stale PID files automatically.
pub fn is_broker_running() -> bool {
    get_broker_pid().is_some()
}

/// Get the PID of the running broker, if any.
pub fn get_broker_pid() -> Option<u32> {
    read_pid(&get_pid_file_path())
}

/// Reads a PID file and returns the PID if that process is alive.
///
/// Unparsable files and files naming a dead process are removed.
pub fn read_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Writes the current process id to `path`, creating parent directories.
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Failed to write PID file: {}", path.display()))?;
    tracing::debug!("Wrote PID file {:?}", path);
    Ok(())
}

/// Removes the PID file if it still names this process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        == Some(std::process::id());
    if ours {
        cleanup_stale_pid_file(path);
    }
}

/// Check if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        // Signal 0 only checks that the process exists.
        match i32::try_from(pid) {
            Ok(raw) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok(),
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
