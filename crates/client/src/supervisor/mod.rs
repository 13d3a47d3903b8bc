//! Broker process supervision.
//!
//! [`Supervisor::ensure_running`] makes sure a healthy broker answers on the
//! configured port, launching one when needed:
//!
//! ```text
//! Idle ─▶ LocatingRuntime ─▶ LocatingInstall ─▶ Spawning ─▶ Verifying ─▶ Running
//!              │                   │               │            │
//!              └───────────────────┴───────────────┴────────────┴──▶ Failed
//! ```
//!
//! A broker that is already healthy, whoever started it, is accepted as is.
//! Launches are serialised, so concurrent callers never start two brokers.

pub mod health;
pub mod install;
pub mod runtime;
pub mod strategy;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::settings::{RuntimePath, Settings, SettingsError};

pub use health::{HealthProbe, HttpHealthProbe};
pub use install::{BrokerInstall, InstallLocator};
pub use runtime::{ResolvedRuntime, RuntimeLocator, RuntimeSource};
pub use strategy::{default_strategies, CargoRun, DirectBinary, LaunchContext, LaunchStrategy};

/// Probe interval while a slow launch is still starting up.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    LocatingRuntime,
    LocatingInstall,
    Spawning,
    Verifying,
    Running,
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::LocatingRuntime => "locating runtime",
            SupervisorState::LocatingInstall => "locating install",
            SupervisorState::Spawning => "spawning",
            SupervisorState::Verifying => "verifying",
            SupervisorState::Running => "running",
            SupervisorState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a single launch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Still running after the liveness check.
    Alive,
    /// Exited during the liveness check.
    Exited(Option<i32>),
    /// The process could not be started.
    SpawnFailed(String),
    /// The install lacks what this strategy needs.
    NotApplicable,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Alive => f.write_str("alive"),
            AttemptOutcome::Exited(Some(code)) => write!(f, "exited with code {}", code),
            AttemptOutcome::Exited(None) => f.write_str("killed by a signal"),
            AttemptOutcome::SpawnFailed(reason) => write!(f, "could not start: {}", reason),
            AttemptOutcome::NotApplicable => f.write_str("not applicable to this install"),
        }
    }
}

/// Record of one launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchAttempt {
    pub strategy: &'static str,
    pub program: PathBuf,
    pub working_dir: PathBuf,
    pub outcome: AttemptOutcome,
}

impl fmt::Display for LaunchAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outcome == AttemptOutcome::NotApplicable {
            return write!(f, "{}: {}", self.strategy, self.outcome);
        }
        write!(
            f,
            "{} ({} in {}): {}",
            self.strategy,
            self.program.display(),
            self.working_dir.display(),
            self.outcome
        )
    }
}

fn list_attempts(attempts: &[LaunchAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn list_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reasons the broker could not be brought up.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("runtime not found at {}", .0.display())]
    RuntimeNotFound(PathBuf),

    #[error("broker files not found; looked for {}", list_paths(.probed))]
    FilesNotFound { probed: Vec<PathBuf> },

    #[error("broker would not stay alive: {}", list_attempts(.attempts))]
    AllStrategiesFailed { attempts: Vec<LaunchAttempt> },

    #[error("broker started with {strategy} (pid {pid:?}) but did not answer its health check")]
    Unresponsive {
        strategy: &'static str,
        pid: Option<u32>,
    },

    #[error("broker started with {strategy} but exited before answering its health check ({outcome})")]
    ProcessExited {
        strategy: &'static str,
        outcome: AttemptOutcome,
    },

    #[error(transparent)]
    Settings(Arc<SettingsError>),
}

impl From<SettingsError> for SupervisorError {
    fn from(err: SettingsError) -> Self {
        SupervisorError::Settings(Arc::new(err))
    }
}

/// Supervisor parameters.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub port: u16,
    pub runtime_path: RuntimePath,
    /// How long a new process must survive before it counts as started.
    pub spawn_check: Duration,
    /// Delay between a surviving spawn and the health probe.
    pub verify_grace: Duration,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            port: settings.port,
            runtime_path: settings.runtime_path.clone(),
            spawn_check: settings.timing.spawn_check(),
            verify_grace: settings.timing.verify_grace(),
        }
    }
}

/// The broker process this supervisor launched.
#[derive(Debug)]
struct ManagedServer {
    child: Child,
    strategy: &'static str,
    startup_allowance: Duration,
    attempt: LaunchAttempt,
}

/// Finds, launches and verifies the broker.
pub struct Supervisor {
    config: SupervisorConfig,
    runtime: RuntimeLocator,
    install: InstallLocator,
    strategies: Vec<Box<dyn LaunchStrategy>>,
    probe: Arc<dyn HealthProbe>,
    state_tx: watch::Sender<SupervisorState>,
    /// Serialises launches.
    launch_lock: Mutex<()>,
    managed: Mutex<Option<ManagedServer>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        runtime: RuntimeLocator,
        install: InstallLocator,
        strategies: Vec<Box<dyn LaunchStrategy>>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Self {
            config,
            runtime,
            install,
            strategies,
            probe,
            state_tx,
            launch_lock: Mutex::new(()),
            managed: Mutex::new(None),
        }
    }

    /// Supervisor for this machine, driven by the user's settings.
    pub fn from_settings(
        settings: &Settings,
        plugin_data_dir: Option<PathBuf>,
    ) -> Result<Self, SupervisorError> {
        let probe = HttpHealthProbe::new(settings.health_url()?, settings.timing.health_timeout());
        Ok(Self::new(
            SupervisorConfig::from_settings(settings),
            RuntimeLocator::from_env(),
            InstallLocator::from_env(plugin_data_dir),
            default_strategies(),
            Arc::new(probe),
        ))
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// PID of the broker this supervisor launched, if it holds one.
    pub async fn managed_pid(&self) -> Option<u32> {
        self.managed
            .lock()
            .await
            .as_ref()
            .and_then(|managed| managed.child.id())
    }

    /// The launch attempt that produced the managed broker.
    pub async fn managed_launch(&self) -> Option<LaunchAttempt> {
        self.managed
            .lock()
            .await
            .as_ref()
            .map(|managed| managed.attempt.clone())
    }

    fn set_state(&self, state: SupervisorState) {
        self.state_tx.send_replace(state);
        tracing::debug!(%state, "Supervisor state changed");
    }

    fn fail<T>(&self, err: SupervisorError) -> Result<T, SupervisorError> {
        tracing::warn!("Broker launch failed: {}", err);
        self.set_state(SupervisorState::Failed);
        Err(err)
    }

    /// Make sure a healthy broker is answering, launching one if needed.
    ///
    /// Returns immediately when the broker already answers its health check.
    pub async fn ensure_running(&self) -> Result<(), SupervisorError> {
        if self.probe.check().await {
            self.set_state(SupervisorState::Running);
            return Ok(());
        }

        let _launch = self.launch_lock.lock().await;

        self.set_state(SupervisorState::LocatingRuntime);
        let runtime = match self.runtime.locate(&self.config.runtime_path) {
            Ok(runtime) => runtime,
            Err(e) => return self.fail(e),
        };

        self.set_state(SupervisorState::LocatingInstall);
        let install = match self.install.locate() {
            Ok(install) => install,
            Err(e) => return self.fail(e),
        };

        // Another caller may have finished a launch while we waited.
        if self.probe.check().await {
            tracing::debug!("Broker became healthy while waiting to launch");
            self.set_state(SupervisorState::Running);
            return Ok(());
        }

        // A broker we launched that no longer answers is killed before its
        // replacement starts, so it cannot linger or hold the port.
        if let Some(mut stale) = self.managed.lock().await.take() {
            let pid = stale.child.id();
            tracing::warn!(?pid, strategy = stale.strategy, "Managed broker stopped answering, replacing it");
            if let Err(e) = stale.child.kill().await {
                tracing::warn!(?pid, "Failed to kill stale broker: {}", e);
            }
        }

        self.set_state(SupervisorState::Spawning);
        let ctx = LaunchContext {
            runtime,
            install,
            port: self.config.port,
        };
        let mut server = match self.spawn_first_alive(&ctx).await {
            Ok(server) => server,
            Err(e) => return self.fail(e),
        };

        self.set_state(SupervisorState::Verifying);
        tokio::time::sleep(self.config.verify_grace).await;

        if self.probe.check().await || self.await_slow_start(&mut server).await {
            tracing::info!(
                strategy = server.strategy,
                pid = ?server.child.id(),
                port = self.config.port,
                "Broker is running"
            );
            *self.managed.lock().await = Some(server);
            self.set_state(SupervisorState::Running);
            return Ok(());
        }

        let err = match server.child.try_wait() {
            Ok(Some(status)) => SupervisorError::ProcessExited {
                strategy: server.strategy,
                outcome: AttemptOutcome::Exited(status.code()),
            },
            Ok(None) | Err(_) => {
                let pid = server.child.id();
                if let Err(e) = server.child.kill().await {
                    tracing::warn!(?pid, "Failed to kill unresponsive broker: {}", e);
                }
                SupervisorError::Unresponsive {
                    strategy: server.strategy,
                    pid,
                }
            }
        };
        self.fail(err)
    }

    /// Keeps probing a launch that has not answered yet, for as long as it
    /// stays alive and within its startup allowance.
    async fn await_slow_start(&self, server: &mut ManagedServer) -> bool {
        if server.startup_allowance.is_zero() {
            return false;
        }
        tracing::info!(
            strategy = server.strategy,
            allowance = ?server.startup_allowance,
            "Broker not answering yet, waiting for it to start"
        );

        let deadline = Instant::now() + server.startup_allowance;
        while Instant::now() < deadline {
            if !matches!(server.child.try_wait(), Ok(None)) {
                return false;
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            if self.probe.check().await {
                return true;
            }
        }
        false
    }

    /// Try each strategy in order; the first process still alive after
    /// `spawn_check` wins.
    async fn spawn_first_alive(&self, ctx: &LaunchContext) -> Result<ManagedServer, SupervisorError> {
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let name = strategy.name();
            let Some(mut launch) = strategy.prepare(ctx) else {
                tracing::debug!(strategy = name, "Strategy not applicable");
                attempts.push(LaunchAttempt {
                    strategy: name,
                    program: PathBuf::new(),
                    working_dir: ctx.install.root.clone(),
                    outcome: AttemptOutcome::NotApplicable,
                });
                continue;
            };

            tracing::info!(
                strategy = name,
                program = ?launch.program,
                working_dir = ?launch.working_dir,
                "Launching broker"
            );
            let outcome = match launch.command.spawn() {
                Ok(mut child) => {
                    tokio::time::sleep(self.config.spawn_check).await;
                    match child.try_wait() {
                        Ok(None) => {
                            return Ok(ManagedServer {
                                child,
                                strategy: name,
                                startup_allowance: strategy.startup_allowance(),
                                attempt: LaunchAttempt {
                                    strategy: name,
                                    program: launch.program,
                                    working_dir: launch.working_dir,
                                    outcome: AttemptOutcome::Alive,
                                },
                            })
                        }
                        Ok(Some(status)) => AttemptOutcome::Exited(status.code()),
                        Err(e) => {
                            let _ = child.kill().await;
                            AttemptOutcome::SpawnFailed(e.to_string())
                        }
                    }
                }
                Err(e) => AttemptOutcome::SpawnFailed(e.to_string()),
            };

            tracing::warn!(strategy = name, %outcome, "Launch attempt failed");
            attempts.push(LaunchAttempt {
                strategy: name,
                program: launch.program,
                working_dir: launch.working_dir,
                outcome,
            });
        }

        Err(SupervisorError::AllStrategiesFailed { attempts })
    }

    /// Ask the managed broker to exit and return to `Idle` without waiting.
    ///
    /// Returns `false` when this supervisor holds no broker.
    pub async fn stop(&self) -> bool {
        let managed = self.managed.lock().await.take();
        self.set_state(SupervisorState::Idle);

        let Some(mut managed) = managed else {
            return false;
        };
        let pid = managed.child.id();
        tracing::info!(?pid, "Stopping broker");
        terminate(&mut managed.child, pid);
        true
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::warn!(pid = raw, "Failed to send SIGTERM: {}", e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill broker: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use protocol::{HealthSnapshot, MemoryUsage, STATUS_OK};
    use tempfile::TempDir;

    /// Probe answering from a script, then with `fallback`.
    struct ScriptedProbe {
        answers: StdMutex<VecDeque<bool>>,
        fallback: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(answers: &[bool], fallback: bool) -> Arc<Self> {
            Arc::new(Self {
                answers: StdMutex::new(answers.iter().copied().collect()),
                fallback,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl HealthProbe for ScriptedProbe {
        fn snapshot<'a>(
            &'a self,
        ) -> Pin<Box<dyn Future<Output = Option<HealthSnapshot>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let healthy = self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            Box::pin(async move {
                healthy.then(|| HealthSnapshot {
                    status: STATUS_OK.to_string(),
                    terminals: 0,
                    platform: "test".to_string(),
                    uptime: 0.0,
                    memory: MemoryUsage::default(),
                })
            })
        }
    }

    /// Runs `sh -c <script>` and counts how often it was prepared.
    struct ShellStrategy {
        name: &'static str,
        script: &'static str,
        prepared: Arc<AtomicUsize>,
        startup_allowance: Duration,
    }

    impl ShellStrategy {
        fn boxed(name: &'static str, script: &'static str, prepared: &Arc<AtomicUsize>) -> Box<dyn LaunchStrategy> {
            Self::slow(name, script, prepared, Duration::ZERO)
        }

        fn slow(
            name: &'static str,
            script: &'static str,
            prepared: &Arc<AtomicUsize>,
            startup_allowance: Duration,
        ) -> Box<dyn LaunchStrategy> {
            Box::new(Self {
                name,
                script,
                prepared: prepared.clone(),
                startup_allowance,
            })
        }
    }

    impl LaunchStrategy for ShellStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        fn startup_allowance(&self) -> Duration {
            self.startup_allowance
        }

        fn prepare(&self, ctx: &LaunchContext) -> Option<strategy::PreparedLaunch> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            let mut command = ctx.command("/bin/sh", &ctx.install.root);
            command.args(["-c", self.script]);
            Some(strategy::PreparedLaunch {
                command,
                program: PathBuf::from("/bin/sh"),
                working_dir: ctx.install.root.clone(),
            })
        }
    }

    /// An install root holding a (fake) broker binary.
    fn install_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(install::BROKER_BINARY), "").unwrap();
        dir
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            port: 4999,
            runtime_path: RuntimePath::Auto,
            spawn_check: Duration::from_millis(300),
            verify_grace: Duration::from_millis(50),
        }
    }

    fn supervisor(
        root: &std::path::Path,
        strategies: Vec<Box<dyn LaunchStrategy>>,
        probe: Arc<dyn HealthProbe>,
    ) -> Supervisor {
        Supervisor::new(
            config(),
            RuntimeLocator::default(),
            InstallLocator::new(vec![root.to_path_buf()]),
            strategies,
            probe,
        )
    }

    /// Live and not a zombie.
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_healthy_server_is_accepted_without_spawning() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![ShellStrategy::boxed("sleeper", "sleep 30", &prepared)],
            ScriptedProbe::new(&[], true),
        );

        sup.ensure_running().await.unwrap();
        sup.ensure_running().await.unwrap();

        assert_eq!(sup.state(), SupervisorState::Running);
        assert_eq!(prepared.load(Ordering::SeqCst), 0);
        assert_eq!(sup.managed_pid().await, None);
    }

    #[tokio::test]
    async fn test_missing_files_spawn_nothing() {
        let empty = TempDir::new().unwrap();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            empty.path(),
            vec![ShellStrategy::boxed("sleeper", "sleep 30", &prepared)],
            ScriptedProbe::new(&[], false),
        );

        match sup.ensure_running().await {
            Err(SupervisorError::FilesNotFound { probed }) => assert!(!probed.is_empty()),
            other => panic!("Expected FilesNotFound, got {:?}", other),
        }
        assert_eq!(sup.state(), SupervisorState::Failed);
        assert_eq!(prepared.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_explicit_runtime_fails_early() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let mut sup = supervisor(
            root.path(),
            vec![ShellStrategy::boxed("sleeper", "sleep 30", &prepared)],
            ScriptedProbe::new(&[], false),
        );
        sup.config.runtime_path = RuntimePath::Explicit(root.path().join("no-cargo"));

        assert!(matches!(
            sup.ensure_running().await,
            Err(SupervisorError::RuntimeNotFound(_))
        ));
        assert_eq!(prepared.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_through_to_surviving_strategy() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![
                ShellStrategy::boxed("crasher", "exit 1", &prepared),
                ShellStrategy::boxed("sleeper", "sleep 30", &prepared),
            ],
            // Unhealthy before launch and on the re-check, healthy after.
            ScriptedProbe::new(&[false, false], true),
        );

        sup.ensure_running().await.unwrap();

        assert_eq!(sup.state(), SupervisorState::Running);
        assert_eq!(prepared.load(Ordering::SeqCst), 2);
        let pid = sup.managed_pid().await.unwrap();
        assert!(process_alive(pid));
        let launch = sup.managed_launch().await.unwrap();
        assert_eq!(launch.strategy, "sleeper");
        assert_eq!(launch.outcome, AttemptOutcome::Alive);

        assert!(sup.stop().await);
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert_eq!(sup.managed_pid().await, None);
    }

    #[tokio::test]
    async fn test_relaunch_kills_stale_managed_server() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![ShellStrategy::boxed("sleeper", "sleep 30", &prepared)],
            // First launch: down, down, verified. Then the broker stops
            // answering and the second launch sees down, down, verified.
            ScriptedProbe::new(&[false, false, true, false, false], true),
        );

        sup.ensure_running().await.unwrap();
        let first = sup.managed_pid().await.unwrap();

        sup.ensure_running().await.unwrap();
        let second = sup.managed_pid().await.unwrap();

        assert_ne!(first, second);
        assert!(!process_alive(first), "stale broker {} must be killed", first);
        assert!(process_alive(second));
        assert_eq!(prepared.load(Ordering::SeqCst), 2);

        assert!(sup.stop().await);
    }

    #[tokio::test]
    async fn test_all_strategies_failing_aggregates_attempts() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![
                ShellStrategy::boxed("first", "exit 1", &prepared),
                ShellStrategy::boxed("second", "exit 2", &prepared),
            ],
            ScriptedProbe::new(&[], false),
        );

        let err = sup.ensure_running().await.unwrap_err();
        match &err {
            SupervisorError::AllStrategiesFailed { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].strategy, "first");
                assert_eq!(attempts[0].outcome, AttemptOutcome::Exited(Some(1)));
                assert_eq!(attempts[1].outcome, AttemptOutcome::Exited(Some(2)));
            }
            other => panic!("Expected AllStrategiesFailed, got {:?}", other),
        }
        let message = err.to_string();
        assert!(message.contains("would not stay alive"));
        assert!(message.contains("first") && message.contains("second"));

        assert_eq!(sup.state(), SupervisorState::Failed);
        assert_eq!(sup.managed_pid().await, None);
    }

    #[tokio::test]
    async fn test_unresponsive_server_is_killed() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![ShellStrategy::boxed("sleeper", "sleep 30", &prepared)],
            ScriptedProbe::new(&[], false),
        );

        match sup.ensure_running().await {
            Err(SupervisorError::Unresponsive { strategy, pid }) => {
                assert_eq!(strategy, "sleeper");
                let pid = pid.unwrap();
                assert!(!process_alive(pid), "unresponsive broker must be killed");
            }
            other => panic!("Expected Unresponsive, got {:?}", other),
        }
        assert_eq!(sup.state(), SupervisorState::Failed);
        assert_eq!(sup.managed_pid().await, None);
    }

    #[tokio::test]
    async fn test_slow_start_is_polled_within_allowance() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![ShellStrategy::slow("builder", "sleep 30", &prepared, Duration::from_secs(5))],
            // Down before launch, on the re-check and after the grace; the
            // second poll answers.
            ScriptedProbe::new(&[false, false, false, false], true),
        );

        sup.ensure_running().await.unwrap();

        assert_eq!(sup.state(), SupervisorState::Running);
        assert_eq!(sup.managed_launch().await.unwrap().strategy, "builder");
        assert!(sup.stop().await);
    }

    #[tokio::test]
    async fn test_slow_start_that_exits_is_process_exited() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![ShellStrategy::slow("builder", "sleep 1; exit 101", &prepared, Duration::from_secs(10))],
            ScriptedProbe::new(&[], false),
        );

        match sup.ensure_running().await {
            Err(SupervisorError::ProcessExited { strategy, outcome }) => {
                assert_eq!(strategy, "builder");
                assert_eq!(outcome, AttemptOutcome::Exited(Some(101)));
            }
            other => panic!("Expected ProcessExited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exit_during_grace_is_process_exited() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let mut sup = supervisor(
            root.path(),
            vec![ShellStrategy::boxed("short-lived", "sleep 0.5; exit 3", &prepared)],
            ScriptedProbe::new(&[], false),
        );
        sup.config.spawn_check = Duration::from_millis(100);
        sup.config.verify_grace = Duration::from_millis(1200);

        match sup.ensure_running().await {
            Err(SupervisorError::ProcessExited { strategy, outcome }) => {
                assert_eq!(strategy, "short-lived");
                assert_eq!(outcome, AttemptOutcome::Exited(Some(3)));
            }
            other => panic!("Expected ProcessExited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_launch_once() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = Arc::new(supervisor(
            root.path(),
            vec![ShellStrategy::boxed("sleeper", "sleep 30", &prepared)],
            // Both pre-lock probes and the first re-check fail; afterwards healthy.
            ScriptedProbe::new(&[false, false, false], true),
        ));

        let a = tokio::spawn({
            let sup = sup.clone();
            async move { sup.ensure_running().await }
        });
        let b = tokio::spawn({
            let sup = sup.clone();
            async move { sup.ensure_running().await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_server() {
        let root = install_root();
        let sup = supervisor(root.path(), Vec::new(), ScriptedProbe::new(&[], false));
        assert!(!sup.stop().await);
        assert_eq!(sup.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_stop_terminates_process() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![ShellStrategy::boxed("sleeper", "sleep 30", &prepared)],
            ScriptedProbe::new(&[false, false], true),
        );
        sup.ensure_running().await.unwrap();
        let pid = sup.managed_pid().await.unwrap();

        sup.stop().await;

        let mut gone = false;
        for _ in 0..50 {
            if !process_alive(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "broker should exit after SIGTERM");
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let root = install_root();
        let prepared = Arc::new(AtomicUsize::new(0));
        let sup = supervisor(
            root.path(),
            vec![ShellStrategy::boxed("crasher", "exit 1", &prepared)],
            ScriptedProbe::new(&[], false),
        );
        let mut rx = sup.subscribe();
        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                seen.push(state);
                if state == SupervisorState::Failed {
                    break;
                }
            }
            seen
        });

        assert!(sup.ensure_running().await.is_err());
        let seen = seen.await.unwrap();
        assert!(seen.contains(&SupervisorState::Spawning));
        assert_eq!(seen.last(), Some(&SupervisorState::Failed));
    }

    #[test]
    fn test_error_messages_are_distinct() {
        let files = SupervisorError::FilesNotFound {
            probed: vec![PathBuf::from("/a/termbridge-broker")],
        };
        assert!(files.to_string().contains("not found"));
        assert!(files.to_string().contains("/a/termbridge-broker"));

        let unresponsive = SupervisorError::Unresponsive {
            strategy: "direct-binary",
            pid: Some(42),
        };
        assert!(unresponsive.to_string().contains("did not answer"));
    }
}
