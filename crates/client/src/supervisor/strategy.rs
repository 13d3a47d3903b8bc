//! Ways of starting the broker.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::install::{BrokerInstall, BROKER_BIN_TARGET};
use super::runtime::ResolvedRuntime;

/// How long a `cargo run` launch may keep building before it must answer.
pub const CARGO_BUILD_ALLOWANCE: Duration = Duration::from_secs(300);

/// Everything a strategy needs to build its command.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub runtime: ResolvedRuntime,
    pub install: BrokerInstall,
    pub port: u16,
}

impl LaunchContext {
    /// Environment handed to every launched broker.
    pub fn env(&self) -> Vec<(&'static str, OsString)> {
        let port = OsString::from(self.port.to_string());
        let mut env = vec![
            ("TERMBRIDGE_PORT", port.clone()),
            ("PORT", port),
            ("TERMBRIDGE_ENV", OsString::from("production")),
            ("TERMBRIDGE_RUNTIME", self.runtime.path.clone().into_os_string()),
        ];
        if let Some(path) = self.search_path() {
            env.push(("PATH", path));
        }
        env
    }

    /// Inherited `PATH` with the runtime directory in front.
    fn search_path(&self) -> Option<OsString> {
        let inherited = std::env::var_os("PATH");
        let Some(dir) = self.runtime.dir() else {
            return inherited;
        };

        let mut dirs = vec![dir.to_path_buf()];
        if let Some(inherited) = &inherited {
            dirs.extend(std::env::split_paths(inherited).filter(|p| p != dir));
        }
        match std::env::join_paths(dirs) {
            Ok(joined) => Some(joined),
            Err(e) => {
                tracing::warn!("Cannot prepend {:?} to PATH: {}", dir, e);
                inherited
            }
        }
    }

    /// Base command with the broker environment applied.
    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>, working_dir: &Path) -> Command {
        let mut command = Command::new(program);
        command
            .current_dir(working_dir)
            .envs(self.env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        command
    }
}

/// A prepared launch: the command plus what to report about it.
#[derive(Debug)]
pub struct PreparedLaunch {
    pub command: Command,
    pub program: PathBuf,
    pub working_dir: PathBuf,
}

/// One way of starting the broker.
///
/// Strategies are tried in order; `prepare` returns `None` when the install
/// lacks what the strategy needs.
pub trait LaunchStrategy: Send + Sync {
    /// Short name used in logs and error reports.
    fn name(&self) -> &'static str;

    fn prepare(&self, ctx: &LaunchContext) -> Option<PreparedLaunch>;

    /// Time past the verify grace during which a launch that is still alive
    /// keeps being probed. Zero means a single probe decides.
    fn startup_allowance(&self) -> Duration {
        Duration::ZERO
    }
}

/// Runs the prebuilt broker binary directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectBinary;

impl LaunchStrategy for DirectBinary {
    fn name(&self) -> &'static str {
        "direct-binary"
    }

    fn prepare(&self, ctx: &LaunchContext) -> Option<PreparedLaunch> {
        let binary = ctx.install.binary.as_ref()?;
        let working_dir = ctx.install.root.clone();
        let mut command = ctx.command(binary, &working_dir);
        command.arg("serve");
        Some(PreparedLaunch {
            command,
            program: binary.clone(),
            working_dir,
        })
    }
}

/// Builds and runs the broker through `cargo run`.
///
/// A cold install compiles the broker first, which outlasts the usual
/// verify grace. The strategy therefore asks for [`CARGO_BUILD_ALLOWANCE`]
/// and the supervisor keeps probing while cargo is still running.
#[derive(Debug, Clone, Copy, Default)]
pub struct CargoRun;

impl LaunchStrategy for CargoRun {
    fn name(&self) -> &'static str {
        "cargo-run"
    }

    fn startup_allowance(&self) -> Duration {
        CARGO_BUILD_ALLOWANCE
    }

    fn prepare(&self, ctx: &LaunchContext) -> Option<PreparedLaunch> {
        let manifest = ctx.install.manifest.as_ref()?;
        let working_dir = manifest.parent()?.to_path_buf();
        let mut command = ctx.command(&ctx.runtime.path, &working_dir);
        command.args([
            "run",
            "--release",
            "--quiet",
            "--bin",
            BROKER_BIN_TARGET,
            "--",
            "serve",
        ]);
        Some(PreparedLaunch {
            command,
            program: ctx.runtime.path.clone(),
            working_dir,
        })
    }
}

/// Default strategy order: prebuilt binary first, then cargo.
pub fn default_strategies() -> Vec<Box<dyn LaunchStrategy>> {
    vec![Box::new(DirectBinary), Box::new(CargoRun)]
}
