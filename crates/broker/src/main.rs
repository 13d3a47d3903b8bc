//! termbridge broker
//!
//! Local PTY session broker behind a WebSocket transport.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use broker::config::Config;
use broker::pidfile::{get_broker_pid, get_pid_file_path, remove_pid_file, write_pid_file};
use broker::server::BrokerServer;
use clap::{Parser, Subcommand};
use protocol::HealthSnapshot;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Timeout for the `status` health request.
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// termbridge broker - local PTY sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "termbridge-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for the broker.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the broker in the foreground
    Serve {
        /// Port to listen on (overrides config and environment)
        #[arg(long, short)]
        port: Option<u16>,

        /// Address to bind to (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Query the running broker's health endpoint
    Status,

    /// Stop the running broker
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 10)
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let env_overrides = config.apply_env_overrides();

    let command = cli.command.clone().unwrap_or(Commands::Serve {
        port: None,
        bind: None,
    });
    if let Commands::Serve { port, bind } = &command {
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(bind) = bind {
            config.server.bind = bind.clone();
        }
    }

    let _log_guard = init_logging(&config, cli.verbose)?;
    for env_override in &env_overrides {
        env_override.log();
    }
    if let Some(path) = &cli.config {
        tracing::info!("Using config file: {:?}", path);
    }

    config.validate()?;

    match command {
        Commands::Serve { .. } => serve(config).await,
        Commands::Status => match query_status(&config).await {
            Ok(snapshot) => {
                println!("Broker Status: {}", snapshot.status);
                println!("  Terminals: {}", snapshot.terminals);
                println!("  Platform:  {}", snapshot.platform);
                println!("  Uptime:    {}", format_duration(snapshot.uptime as u64));
                println!("  Memory:    {} KiB resident", snapshot.memory.rss / 1024);
                Ok(())
            }
            Err(e) => {
                eprintln!("Broker is not running: {:#}", e);
                std::process::exit(1);
            }
        },
        Commands::Stop { force, timeout } => {
            stop_broker(force, Duration::from_secs(timeout)).await?;
            Ok(())
        }
    }
}

/// Sets up stderr logging plus an optional daily-rolling log file.
///
/// The returned guard flushes the file writer on drop.
fn init_logging(
    config: &Config,
    verbose: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.server.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.server.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "broker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Runs the broker until SIGTERM or SIGINT.
async fn serve(config: Config) -> anyhow::Result<()> {
    if let Some(pid) = get_broker_pid() {
        eprintln!("Error: Broker already running (PID: {})", pid);
        eprintln!();
        eprintln!("To stop the existing broker, run:");
        eprintln!("  termbridge-broker stop");
        std::process::exit(1);
    }

    let pid_path = get_pid_file_path();
    write_pid_file(&pid_path)?;

    let mut server = BrokerServer::new(config);
    let result = run_until_signal(&mut server).await;

    remove_pid_file(&pid_path);
    result
}

async fn run_until_signal(server: &mut BrokerServer) -> anyhow::Result<()> {
    let addr = server.start().await?;
    tracing::info!("termbridge broker ready on ws://{}/", addr);

    wait_for_shutdown_signal().await?;

    server.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// The handlers stay installed afterwards, so further signals during
/// shutdown are absorbed.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Address used to reach the broker locally.
fn local_endpoint(config: &Config) -> String {
    let host = match config.server.bind.as_str() {
        "0.0.0.0" => "127.0.0.1",
        "::" => "[::1]",
        other if other.contains(':') => return format!("[{}]:{}", other, config.server.port),
        other => other,
    };
    format!("{}:{}", host, config.server.port)
}

/// Query `GET /health` on the configured port.
async fn query_status(config: &Config) -> anyhow::Result<HealthSnapshot> {
    let url = format!("http://{}/health", local_endpoint(config));
    let client = reqwest::Client::builder()
        .timeout(STATUS_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let snapshot = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("No answer from {}", url))?
        .error_for_status()?
        .json::<HealthSnapshot>()
        .await
        .context("Malformed health response")?;
    Ok(snapshot)
}

/// Stop the broker named by the PID file.
///
/// Sends SIGTERM and waits up to `timeout` for the process to go away, or
/// sends SIGKILL immediately when `force` is set.
async fn stop_broker(force: bool, timeout: Duration) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_broker_pid().context("Broker is not running (no live PID file)")?;
    let raw = i32::try_from(pid).context("PID out of range")?;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };

    kill(Pid::from_raw(raw), signal)
        .with_context(|| format!("Failed to signal broker (PID {})", pid))?;
    println!("Sent {} to broker (PID {})", signal, pid);

    if force {
        // A killed broker cannot remove its own PID file.
        let _ = std::fs::remove_file(get_pid_file_path());
        return Ok(());
    }

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if get_broker_pid() != Some(pid) {
            println!("Broker stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!(
        "Timeout waiting for broker to exit ({}s); try: termbridge-broker stop --force",
        timeout.as_secs()
    )
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::try_parse_from(["termbridge-broker"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_serve_with_overrides() {
        let cli =
            Cli::try_parse_from(["termbridge-broker", "serve", "--port", "4000", "--bind", "0.0.0.0"])
                .unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Serve {
                port: Some(4000),
                bind: Some("0.0.0.0".to_string()),
            })
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["termbridge-broker", "status", "-v", "--config", "/tmp/b.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/b.toml")));
        assert_eq!(cli.command, Some(Commands::Status));
    }

    #[test]
    fn test_stop_defaults() {
        let cli = Cli::try_parse_from(["termbridge-broker", "stop"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Stop {
                force: false,
                timeout: 10
            })
        );
    }

    #[test]
    fn test_stop_with_force_and_timeout() {
        let cli =
            Cli::try_parse_from(["termbridge-broker", "stop", "-f", "--timeout", "3"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Stop {
                force: true,
                timeout: 3
            })
        );
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(Cli::try_parse_from(["termbridge-broker", "serve", "--port", "70000"]).is_err());
    }

    #[test]
    fn test_local_endpoint() {
        let mut config = Config::default();
        assert_eq!(local_endpoint(&config), "127.0.0.1:3457");

        config.server.bind = "0.0.0.0".to_string();
        assert_eq!(local_endpoint(&config), "127.0.0.1:3457");

        config.server.bind = "::1".to_string();
        assert_eq!(local_endpoint(&config), "[::1]:3457");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }
}
