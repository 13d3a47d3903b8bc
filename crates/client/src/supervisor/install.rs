//! Locating the installed broker.
//!
//! A directory counts as an install when it holds the broker binary
//! (`termbridge-broker` or `bin/termbridge-broker`) or a cargo manifest
//! that builds it (`Cargo.toml` or `crates/broker/Cargo.toml`).

use std::fs;
use std::path::{Path, PathBuf};

use super::SupervisorError;

/// Name of the broker executable.
pub const BROKER_BINARY: &str = if cfg!(windows) {
    "termbridge-broker.exe"
} else {
    "termbridge-broker"
};

/// Bin target name used when building the broker with cargo.
pub const BROKER_BIN_TARGET: &str = "termbridge-broker";

/// A located broker install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInstall {
    /// Directory the install was found in.
    pub root: PathBuf,
    /// Prebuilt broker binary, if present.
    pub binary: Option<PathBuf>,
    /// Manifest that can build the broker, if present.
    pub manifest: Option<PathBuf>,
}

/// Probes an ordered list of directories for a broker install.
#[derive(Debug, Clone, Default)]
pub struct InstallLocator {
    roots: Vec<PathBuf>,
}

impl InstallLocator {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Probe the plugin data dir, the working dir, then the directories
    /// around our own executable.
    pub fn from_env(plugin_data_dir: Option<PathBuf>) -> Self {
        let mut roots = Vec::new();
        roots.extend(plugin_data_dir);
        if let Ok(cwd) = std::env::current_dir() {
            roots.push(cwd);
        }
        if let Ok(exe) = std::env::current_exe() {
            roots.extend(exe.ancestors().skip(1).take(3).map(Path::to_path_buf));
        }
        roots.dedup();
        Self::new(roots)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// First root holding an install. Every probed path is listed in the
    /// error when none does.
    pub fn locate(&self) -> Result<BrokerInstall, SupervisorError> {
        let mut probed = Vec::new();

        for root in &self.roots {
            let binary = binary_candidates(root)
                .into_iter()
                .inspect(|path| probed.push(path.clone()))
                .find(|path| path.is_file());
            let manifest = manifest_candidates(root)
                .into_iter()
                .inspect(|path| probed.push(path.clone()))
                .find(|path| builds_broker(path));

            if binary.is_some() || manifest.is_some() {
                tracing::debug!(root = ?root, binary = ?binary, manifest = ?manifest, "Found broker install");
                return Ok(BrokerInstall {
                    root: root.clone(),
                    binary,
                    manifest,
                });
            }
        }

        Err(SupervisorError::FilesNotFound { probed })
    }
}

fn binary_candidates(root: &Path) -> Vec<PathBuf> {
    vec![root.join(BROKER_BINARY), root.join("bin").join(BROKER_BINARY)]
}

fn manifest_candidates(root: &Path) -> Vec<PathBuf> {
    vec![
        root.join("Cargo.toml"),
        root.join("crates").join("broker").join("Cargo.toml"),
    ]
}

/// A manifest builds the broker when it names the broker bin target.
fn builds_broker(manifest: &Path) -> bool {
    fs::read_to_string(manifest)
        .map(|contents| contents.contains(&format!("\"{}\"", BROKER_BIN_TARGET)))
        .unwrap_or(false)
}
