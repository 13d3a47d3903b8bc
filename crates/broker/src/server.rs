//! Broker server wiring the session manager to HTTP and WebSocket routes.
//!
//! [`BrokerServer`] owns the listener lifecycle: it binds, serves
//! `/health`, `/` and `/ws`, and on stop kills every PTY before letting the
//! listener drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::health::health_handler;
use crate::session::SessionManager;
use crate::transport::ws_handler;

/// How long `stop` waits for the listener to finish.
const SERVE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Killing sessions and draining the listener.
    ShuttingDown,
}

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Builds the broker's routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// The broker process: session manager plus listener.
pub struct BrokerServer {
    config: Config,
    state: Arc<RwLock<ServerState>>,
    app: AppState,
    local_addr: Option<SocketAddr>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerServer {
    /// Creates a server from configuration. Nothing is bound yet.
    pub fn new(config: Config) -> Self {
        let manager = Arc::new(SessionManager::new(
            config.session.default_shell.clone(),
            config.session.max_sessions,
        ));

        Self {
            config,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            app: AppState::new(manager),
            local_addr: None,
            serve_task: Mutex::new(None),
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// The session manager.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.app.manager
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the listener and starts serving in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                anyhow::bail!("Server is already running");
            }
            *state = ServerState::Starting;
        }

        let addr = self.config.listen_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = ServerState::Stopped;
                return Err(e).with_context(|| format!("Failed to bind {}", addr));
            }
        };
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;
        self.local_addr = Some(local_addr);

        let app = router(self.app.clone());
        let token = self.app.shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!("Listener failed: {}", e);
            }
        });
        *self.serve_task.lock().await = Some(task);

        *self.state.write().await = ServerState::Running;
        info!(addr = %local_addr, "Broker listening");
        Ok(local_addr)
    }

    /// Kills every session, clears the registry and stops the listener.
    ///
    /// Repeated calls are harmless.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ServerState::Stopped | ServerState::ShuttingDown => return Ok(()),
                _ => *state = ServerState::ShuttingDown,
            }
        }

        info!("Stopping broker...");

        let killed = self.app.manager.shutdown().await;
        debug!(sessions = killed, "Sessions terminated");

        self.app.shutdown.cancel();

        if let Some(task) = self.serve_task.lock().await.take() {
            if tokio::time::timeout(SERVE_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Listener did not stop within {:?}", SERVE_SHUTDOWN_TIMEOUT);
            }
        }

        *self.state.write().await = ServerState::Stopped;
        info!("Broker stopped");
        Ok(())
    }
}
