//! Session manager for PTY sessions keyed by connection.
//!
//! The registry maps each transport connection to at most one live session.
//! Operations on one session are serialised by that session's mutex, so a
//! resize and a terminate never race, while distinct sessions never wait on
//! each other. Every registered session holds one permit of the session
//! limit, released when its entry is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::{CreateTerminal, ServerEvent, SessionMetadata};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::pty::{
    resolve_cwd, resolve_shell, ConnectionId, PtyEvent, Session, SessionError, SessionId,
    SpawnOptions,
};

/// Outbound event queue of one transport connection.
pub type EventSink = mpsc::Sender<ServerEvent>;

/// Summary of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub pid: Option<u32>,
    pub created_at: u64,
}

#[derive(Clone)]
struct RegistryEntry {
    session_id: SessionId,
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
    _slot: Arc<OwnedSemaphorePermit>,
}

impl RegistryEntry {
    /// Stops forwarding and kills the shell.
    async fn retire(self, connection_id: &ConnectionId) {
        self.cancel.cancel();
        self.session.lock().await.kill();
        tracing::info!(
            connection_id = %connection_id,
            session_id = %self.session_id,
            "Session terminated"
        );
    }
}

type Registry = DashMap<ConnectionId, RegistryEntry>;

/// Owns every live PTY session of the broker.
pub struct SessionManager {
    sessions: Arc<Registry>,
    default_shell: Option<String>,
    max_sessions: usize,
    slots: Arc<Semaphore>,
    shutting_down: AtomicBool,
}

impl SessionManager {
    /// Creates a new session manager.
    pub fn new(default_shell: Option<String>, max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            default_shell,
            max_sessions,
            slots: Arc::new(Semaphore::new(max_sessions)),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Spawns a session for `connection_id`.
    ///
    /// `terminal-created` is pushed into `sink` before any output of the new
    /// session, then output and the final `terminal-exit` follow on the same
    /// sink. A session already owned by the connection is terminated first
    /// and reports nothing further. On error nothing is registered and the
    /// caller reports the error.
    ///
    /// Concurrent creates for one connection leave exactly one session
    /// registered; the others are killed.
    pub async fn create(
        &self,
        connection_id: &ConnectionId,
        request: CreateTerminal,
        sink: EventSink,
    ) -> Result<SessionMetadata, SessionError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShuttingDown);
        }

        if self.terminate(connection_id).await {
            tracing::info!(connection_id = %connection_id, "Replaced existing session");
        }

        let slot = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| SessionError::LimitReached(self.max_sessions))?;

        let shell = resolve_shell(request.shell.as_deref(), self.default_shell.as_deref())?;
        let cwd = resolve_cwd(request.cwd.as_deref());
        let (session, events) = Session::spawn(SpawnOptions {
            shell,
            cwd,
            cols: request.cols.max(1),
            rows: request.rows.max(1),
        })?;

        let metadata = session.metadata();
        let session_id = session.id().clone();
        let cancel = CancellationToken::new();

        if sink
            .send(ServerEvent::TerminalCreated(metadata.clone()))
            .await
            .is_err()
        {
            tracing::debug!(connection_id = %connection_id, "Connection gone before terminal-created");
        }

        let displaced = self.sessions.insert(
            connection_id.clone(),
            RegistryEntry {
                session_id: session_id.clone(),
                session: Arc::new(Mutex::new(session)),
                cancel: cancel.clone(),
                _slot: Arc::new(slot),
            },
        );
        if let Some(displaced) = displaced {
            tracing::warn!(connection_id = %connection_id, "Concurrent create displaced a session");
            displaced.retire(connection_id).await;
        }

        tokio::spawn(forward_events(
            Arc::clone(&self.sessions),
            connection_id.clone(),
            session_id.clone(),
            events,
            sink,
            cancel,
        ));

        tracing::info!(
            connection_id = %connection_id,
            session_id = %session_id,
            shell = %metadata.shell,
            cwd = %metadata.cwd,
            pid = ?metadata.pid,
            cols = metadata.cols,
            rows = metadata.rows,
            "Created new session"
        );

        Ok(metadata)
    }

    /// Writes input to the connection's session.
    pub async fn write(&self, connection_id: &ConnectionId, data: &[u8]) -> Result<(), SessionError> {
        let session = self.session(connection_id)?;
        let session = session.lock().await;
        session.write(data)
    }

    /// Resizes the connection's session.
    ///
    /// A failing resize is logged and leaves the shell running with its old
    /// dimensions. Only a missing session is an error.
    pub async fn resize(
        &self,
        connection_id: &ConnectionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        let session = self.session(connection_id)?;
        let mut session = session.lock().await;
        if let Err(e) = session.resize(cols.max(1), rows.max(1)) {
            tracing::warn!(
                connection_id = %connection_id,
                session_id = %session.id(),
                error = %e,
                "Resize failed"
            );
        }
        Ok(())
    }

    /// Kills and unregisters the connection's session, if any.
    ///
    /// Returns whether a session was removed. Calling it again is a no-op.
    pub async fn terminate(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, entry)) = self.sessions.remove(connection_id) else {
            return false;
        };

        entry.retire(connection_id).await;
        true
    }

    /// Whether the connection currently owns a session.
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.sessions.contains_key(connection_id)
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of all live sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let entries: Vec<(ConnectionId, RegistryEntry)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut infos = Vec::with_capacity(entries.len());
        for (connection_id, entry) in entries {
            let session = entry.session.lock().await;
            let (cols, rows) = session.size();
            infos.push(SessionInfo {
                connection_id,
                session_id: entry.session_id,
                shell: session.shell().to_string(),
                cwd: session.cwd().to_string_lossy().into_owned(),
                cols,
                rows,
                pid: session.pid(),
                created_at: session.created_at(),
            });
        }
        infos
    }

    /// Kills every session and stops accepting new ones.
    ///
    /// Safe to call more than once; later calls find nothing to kill.
    pub async fn shutdown(&self) -> usize {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::info!(sessions = self.count(), "Shutting down session manager");
        }

        let connections: Vec<ConnectionId> =
            self.sessions.iter().map(|entry| entry.key().clone()).collect();

        let mut terminated = 0;
        for connection_id in connections {
            if self.terminate(&connection_id).await {
                terminated += 1;
            }
        }
        terminated
    }

    fn session(&self, connection_id: &ConnectionId) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.sessions
            .get(connection_id)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or_else(|| SessionError::NoTerminal(connection_id.clone()))
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(None, crate::config::DEFAULT_MAX_SESSIONS)
    }
}

/// Moves a session's PTY events onto its connection's sink.
///
/// On exit the registry entry is removed, but only while it still belongs to
/// this session, and `terminal-exit` is sent only if that removal happened.
async fn forward_events(
    registry: Arc<Registry>,
    connection_id: ConnectionId,
    session_id: SessionId,
    mut events: mpsc::Receiver<PtyEvent>,
    sink: EventSink,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(PtyEvent::Output(data)) => {
                let delivered = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    sent = sink.send(ServerEvent::output(data)) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Some(PtyEvent::Exited(exit)) => {
                let removed = registry
                    .remove_if(&connection_id, |_, entry| entry.session_id == session_id)
                    .is_some();
                if removed {
                    tracing::debug!(
                        connection_id = %connection_id,
                        session_id = %session_id,
                        exit_code = exit.exit_code,
                        "Session exited"
                    );
                    let _ = sink.send(ServerEvent::TerminalExit(exit)).await;
                }
                break;
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh_request() -> CreateTerminal {
        CreateTerminal {
            shell: Some("/bin/sh".to_string()),
            cols: 80,
            rows: 24,
            cwd: Some(std::env::temp_dir().to_string_lossy().into_owned()),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> Option<ServerEvent> {
        timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    /// Reads events until `terminal-exit`, returning collected output.
    async fn read_until_exit(rx: &mut mpsc::Receiver<ServerEvent>) -> (String, Option<ServerEvent>) {
        let mut output = Vec::new();
        while let Some(event) = next_event(rx).await {
            match event {
                ServerEvent::TerminalOutput { data } => output.extend_from_slice(&data),
                exit @ ServerEvent::TerminalExit(_) => {
                    return (String::from_utf8_lossy(&output).into_owned(), Some(exit))
                }
                _ => {}
            }
        }
        (String::from_utf8_lossy(&output).into_owned(), None)
    }

    #[tokio::test]
    async fn test_create_sends_created_first() {
        let manager = SessionManager::default();
        let (tx, mut rx) = mpsc::channel(64);
        let conn = "conn-1".to_string();

        let meta = manager.create(&conn, sh_request(), tx).await.unwrap();
        assert_eq!(meta.shell, "/bin/sh");
        assert_eq!((meta.cols, meta.rows), (80, 24));
        assert!(manager.contains(&conn));
        assert_eq!(manager.count(), 1);

        match next_event(&mut rx).await {
            Some(ServerEvent::TerminalCreated(created)) => assert_eq!(created, meta),
            other => panic!("Expected terminal-created, got {:?}", other),
        }

        assert!(manager.terminate(&conn).await);
    }

    #[tokio::test]
    async fn test_create_with_missing_shell_registers_nothing() {
        let manager = SessionManager::default();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = "conn-1".to_string();

        let request = CreateTerminal {
            shell: Some("/nonexistent/shell".to_string()),
            ..CreateTerminal::default()
        };
        let result = manager.create(&conn, request, tx).await;

        assert!(matches!(result, Err(SessionError::ShellNotFound(_))));
        assert_eq!(manager.count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_clamps_zero_dimensions() {
        let manager = SessionManager::default();
        let (tx, _rx) = mpsc::channel(64);
        let conn = "conn-1".to_string();

        let request = CreateTerminal {
            cols: 0,
            rows: 0,
            ..sh_request()
        };
        let meta = manager.create(&conn, request, tx).await.unwrap();
        assert_eq!((meta.cols, meta.rows), (1, 1));

        manager.terminate(&conn).await;
    }

    #[tokio::test]
    async fn test_session_limit() {
        let manager = SessionManager::new(None, 1);
        let (tx, _rx) = mpsc::channel(64);

        manager.create(&"a".to_string(), sh_request(), tx.clone()).await.unwrap();
        let result = manager.create(&"b".to_string(), sh_request(), tx).await;
        assert!(matches!(result, Err(SessionError::LimitReached(1))));
        assert_eq!(manager.count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_without_session() {
        let manager = SessionManager::default();

        let result = manager.write(&"nobody".to_string(), b"ls\n").await;
        assert!(matches!(result, Err(SessionError::NoTerminal(_))));
        assert_eq!(manager.count(), 0);

        let result = manager.resize(&"nobody".to_string(), 100, 30).await;
        assert!(matches!(result, Err(SessionError::NoTerminal(_))));
    }

    #[tokio::test]
    async fn test_output_and_single_exit() {
        let manager = SessionManager::default();
        let (tx, mut rx) = mpsc::channel(64);
        let conn = "conn-1".to_string();

        manager.create(&conn, sh_request(), tx).await.unwrap();
        manager.write(&conn, b"echo manager_marker; exit 0\n").await.unwrap();

        let (output, exit) = read_until_exit(&mut rx).await;
        assert!(output.contains("manager_marker"));
        match exit {
            Some(ServerEvent::TerminalExit(exit)) => assert_eq!(exit.exit_code, 0),
            other => panic!("Expected terminal-exit, got {:?}", other),
        }

        // Nothing follows the exit and the entry is gone.
        assert!(next_event(&mut rx).await.is_none());
        assert!(!manager.contains(&conn));
        assert!(matches!(
            manager.write(&conn, b"x").await,
            Err(SessionError::NoTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_silent() {
        let manager = SessionManager::default();
        let (tx, mut rx) = mpsc::channel(64);
        let conn = "conn-1".to_string();

        manager.create(&conn, sh_request(), tx).await.unwrap();
        assert!(manager.terminate(&conn).await);
        assert!(!manager.terminate(&conn).await);
        assert_eq!(manager.count(), 0);

        // A terminated session reports no exit.
        while let Some(event) = next_event(&mut rx).await {
            assert!(
                !matches!(event, ServerEvent::TerminalExit(_)),
                "terminated session must not report an exit"
            );
        }
    }

    #[tokio::test]
    async fn test_second_create_replaces_session() {
        let manager = SessionManager::default();
        let (tx, _rx) = mpsc::channel(64);
        let conn = "conn-1".to_string();

        let first = manager.create(&conn, sh_request(), tx.clone()).await.unwrap();
        let second = manager.create(&conn, sh_request(), tx).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(manager.count(), 1);
        let list = manager.list().await;
        assert_eq!(list[0].session_id, second.id);

        manager.terminate(&conn).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_creates_keep_one_session() {
        let manager = Arc::new(SessionManager::default());
        let (tx, _rx) = mpsc::channel(64);
        let conn = "conn-1".to_string();

        let spawn_create = || {
            let manager = Arc::clone(&manager);
            let conn = conn.clone();
            let tx = tx.clone();
            tokio::spawn(async move { manager.create(&conn, sh_request(), tx).await })
        };
        let (first, second) = tokio::join!(spawn_create(), spawn_create());
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();

        assert_eq!(manager.count(), 1);
        let live = manager.list().await[0].session_id.clone();
        let loser = if live == first.id { &second } else { &first };
        let loser_pid = loser.pid.unwrap() as i32;

        let mut gone = false;
        for _ in 0..50 {
            if nix::sys::signal::kill(nix::unistd::Pid::from_raw(loser_pid), None).is_err() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "displaced shell {} still running", loser_pid);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_limit_slot_released_on_terminate() {
        let manager = SessionManager::new(None, 1);
        let (tx, _rx) = mpsc::channel(64);

        manager.create(&"a".to_string(), sh_request(), tx.clone()).await.unwrap();
        assert!(manager.terminate(&"a".to_string()).await);
        manager.create(&"b".to_string(), sh_request(), tx.clone()).await.unwrap();

        // Replacing within one connection reuses its slot.
        manager.create(&"b".to_string(), sh_request(), tx).await.unwrap();
        assert_eq!(manager.count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_resize_updates_dimensions() {
        let manager = SessionManager::default();
        let (tx, _rx) = mpsc::channel(64);
        let conn = "conn-1".to_string();

        manager.create(&conn, sh_request(), tx).await.unwrap();
        manager.resize(&conn, 120, 40).await.unwrap();

        let list = manager.list().await;
        assert_eq!((list[0].cols, list[0].rows), (120, 40));

        manager.terminate(&conn).await;
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let manager = SessionManager::default();
        let (tx_a, mut rx_a) = mpsc::channel(64);
        let (tx_b, mut rx_b) = mpsc::channel(64);
        let a = "conn-a".to_string();
        let b = "conn-b".to_string();

        manager.create(&a, sh_request(), tx_a).await.unwrap();
        manager.create(&b, sh_request(), tx_b).await.unwrap();

        manager.write(&a, b"echo only_in_a; exit\n").await.unwrap();
        manager.write(&b, b"echo only_in_b; exit\n").await.unwrap();

        let (out_a, _) = read_until_exit(&mut rx_a).await;
        let (out_b, _) = read_until_exit(&mut rx_b).await;

        assert!(out_a.contains("only_in_a") && !out_a.contains("only_in_b"));
        assert!(out_b.contains("only_in_b") && !out_b.contains("only_in_a"));
    }

    #[tokio::test]
    async fn test_shutdown_kills_all_and_is_idempotent() {
        let manager = SessionManager::default();
        let (tx, _rx) = mpsc::channel(64);

        for conn in ["a", "b", "c"] {
            manager.create(&conn.to_string(), sh_request(), tx.clone()).await.unwrap();
        }
        assert_eq!(manager.count(), 3);

        assert_eq!(manager.shutdown().await, 3);
        assert_eq!(manager.count(), 0);
        assert_eq!(manager.shutdown().await, 0);

        let result = manager.create(&"d".to_string(), sh_request(), tx).await;
        assert!(matches!(result, Err(SessionError::ShuttingDown)));
    }
}
