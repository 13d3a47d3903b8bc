//! Locating the cargo runtime used to build and run the broker.
//!
//! ## Probe Order
//!
//! 1. An explicit `runtime_path` setting, which must exist
//! 2. The cargo running us (`$CARGO`)
//! 3. Well-known per-platform install locations
//! 4. Toolchain-manager directories under the home directory
//! 5. The bare program name, resolved through `PATH` at spawn time

use std::fs;
use std::path::{Path, PathBuf};

use super::SupervisorError;
use crate::settings::RuntimePath;

#[cfg(windows)]
const PROGRAM: &str = "cargo.exe";
#[cfg(not(windows))]
const PROGRAM: &str = "cargo";

/// How a runtime path was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSource {
    Explicit,
    Current,
    WellKnown,
    VersionManager,
    /// Bare program name; the OS resolves it when spawning.
    PathLookup,
}

/// A runtime chosen for launching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRuntime {
    pub path: PathBuf,
    pub source: RuntimeSource,
}

impl ResolvedRuntime {
    /// Directory containing the runtime, if the path names one.
    pub fn dir(&self) -> Option<&Path> {
        self.path.parent().filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// Finds the runtime from a fixed set of candidate locations.
#[derive(Debug, Clone, Default)]
pub struct RuntimeLocator {
    current: Option<PathBuf>,
    well_known: Vec<PathBuf>,
    home: Option<PathBuf>,
}

impl RuntimeLocator {
    pub fn new(current: Option<PathBuf>, well_known: Vec<PathBuf>, home: Option<PathBuf>) -> Self {
        Self {
            current,
            well_known,
            home,
        }
    }

    /// Locator for this machine.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var_os("CARGO").map(PathBuf::from),
            well_known_locations(),
            dirs::home_dir(),
        )
    }

    /// Resolve the runtime according to `setting`.
    pub fn locate(&self, setting: &RuntimePath) -> Result<ResolvedRuntime, SupervisorError> {
        if let RuntimePath::Explicit(path) = setting {
            if path.is_file() {
                return Ok(ResolvedRuntime {
                    path: path.clone(),
                    source: RuntimeSource::Explicit,
                });
            }
            return Err(SupervisorError::RuntimeNotFound(path.clone()));
        }

        let found = self
            .current
            .iter()
            .map(|path| (path.clone(), RuntimeSource::Current))
            .chain(
                self.well_known
                    .iter()
                    .map(|path| (path.clone(), RuntimeSource::WellKnown)),
            )
            .chain(
                self.version_manager_candidates()
                    .into_iter()
                    .map(|path| (path, RuntimeSource::VersionManager)),
            )
            .find(|(path, _)| path.is_file());

        let runtime = match found {
            Some((path, source)) => ResolvedRuntime { path, source },
            None => {
                tracing::debug!("No cargo found in known locations, relying on PATH");
                ResolvedRuntime {
                    path: PathBuf::from(PROGRAM),
                    source: RuntimeSource::PathLookup,
                }
            }
        };
        tracing::debug!(path = ?runtime.path, source = ?runtime.source, "Resolved runtime");
        Ok(runtime)
    }

    /// `~/.cargo/bin/cargo`, then each rustup toolchain in name order.
    fn version_manager_candidates(&self) -> Vec<PathBuf> {
        let Some(home) = &self.home else {
            return Vec::new();
        };

        let mut candidates = vec![home.join(".cargo").join("bin").join(PROGRAM)];

        if let Ok(entries) = fs::read_dir(home.join(".rustup").join("toolchains")) {
            let mut toolchains: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            toolchains.sort();
            candidates.extend(
                toolchains
                    .into_iter()
                    .map(|dir| dir.join("bin").join(PROGRAM)),
            );
        }
        candidates
    }
}

fn well_known_locations() -> Vec<PathBuf> {
    let paths: &[&str] = if cfg!(windows) {
        &[r"C:\Program Files\Rust stable MSVC 1.0\bin\cargo.exe"]
    } else if cfg!(target_os = "macos") {
        &[
            "/opt/homebrew/bin/cargo",
            "/usr/local/cargo/bin/cargo",
            "/usr/local/bin/cargo",
        ]
    } else {
        &[
            "/usr/local/cargo/bin/cargo",
            "/usr/local/bin/cargo",
            "/usr/bin/cargo",
        ]
    };
    paths.iter().map(PathBuf::from).collect()
}
