//! PTY session spawning and I/O.
//!
//! A [`Session`] is one shell process attached to a pseudo-terminal. Output
//! is read on a dedicated blocking task and pushed into a bounded channel as
//! [`PtyEvent`]s; the process exit is the last event on that same channel.
//! Input goes the other way through a second blocking task, so a shell that
//! stops reading stdin never stalls the async runtime.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{ErrorCode, SessionMetadata, TerminalExit};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::config::shell_exists;

/// Unique identifier for a session.
pub type SessionId = String;

/// Identifier of the transport connection that owns a session.
pub type ConnectionId = String;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the per-session output channel, in chunks.
///
/// When a client stalls the reader blocks on this channel, which throttles
/// that one shell and nothing else.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the per-session input queue, in writes.
///
/// A full queue means the shell has stopped reading; further input is
/// refused instead of waiting.
pub const INPUT_CHANNEL_CAPACITY: usize = 256;

/// Shell used when neither the request, the config nor `$SHELL` names one.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The requested shell could not be found.
    #[error("shell not found: {0}")]
    ShellNotFound(String),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The configured session limit is reached.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// The connection owns no session.
    #[error("no terminal for connection {0}")]
    NoTerminal(ConnectionId),

    /// The session's process has already exited.
    #[error("session already exited: {0}")]
    Exited(SessionId),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// The shell is not reading its input and the queue is full.
    #[error("input backlog full for session {0}")]
    InputBacklog(SessionId),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The manager is shutting down and accepts no new sessions.
    #[error("broker is shutting down")]
    ShuttingDown,
}

impl SessionError {
    /// Wire error code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::ShellNotFound(_)
            | SessionError::SpawnFailed(_)
            | SessionError::LimitReached(_)
            | SessionError::ShuttingDown => ErrorCode::TerminalCreateFailed,
            SessionError::NoTerminal(_)
            | SessionError::Exited(_)
            | SessionError::WriteFailed(_)
            | SessionError::InputBacklog(_)
            | SessionError::ResizeFailed(_) => ErrorCode::NoTerminal,
        }
    }
}

/// Events produced by a session's reader task, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of output. Boundaries are arbitrary.
    Output(Vec<u8>),
    /// The process ended. Always the final event.
    Exited(TerminalExit),
}

/// Resolved parameters for spawning a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// A PTY session with a shell process.
pub struct Session {
    id: SessionId,
    shell: String,
    cwd: PathBuf,
    cols: u16,
    rows: u16,
    pid: Option<u32>,
    created_at: u64,
    master: Box<dyn MasterPty + Send>,
    input: mpsc::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell", &self.shell)
            .field("cwd", &self.cwd)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawns a shell on a new PTY and starts its reader task.
    ///
    /// The returned receiver yields the session's output followed by exactly
    /// one [`PtyEvent::Exited`]. Dropping the receiver stops the reader.
    pub fn spawn(
        options: SpawnOptions,
    ) -> Result<(Self, mpsc::Receiver<PtyEvent>), SessionError> {
        let id = Uuid::new_v4().to_string();

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.cwd(&options.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // The master sees EOF only once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));

        let writer_id = id.clone();
        tokio::task::spawn_blocking(move || write_loop(&writer_id, writer, input_rx));

        let session_id = id.clone();
        let reader_running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || {
            read_loop(&session_id, reader, &events_tx);

            let exit = match child.wait() {
                Ok(status) => TerminalExit {
                    exit_code: status.exit_code(),
                    signal: status.signal().map(str::to_owned),
                },
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to reap shell");
                    TerminalExit {
                        exit_code: 1,
                        signal: None,
                    }
                }
            };
            reader_running.store(false, Ordering::SeqCst);

            tracing::info!(
                session_id = %session_id,
                exit_code = exit.exit_code,
                signal = ?exit.signal,
                "Shell exited"
            );
            // Fails only when nobody listens any more.
            let _ = events_tx.blocking_send(PtyEvent::Exited(exit));
        });

        let session = Session {
            id,
            shell: options.shell,
            cwd: options.cwd,
            cols: options.cols,
            rows: options.rows,
            pid,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            master: pair.master,
            input: input_tx,
            killer,
            running,
        };

        Ok((session, events_rx))
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Returns the shell command.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Returns the working directory the shell started in.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Unix timestamp (seconds) of session creation.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Returns whether the shell process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Metadata sent to the client in `terminal-created`.
    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            id: self.id.clone(),
            shell: self.shell.clone(),
            cwd: self.cwd.to_string_lossy().into_owned(),
            cols: self.cols,
            rows: self.rows,
            pid: self.pid,
        }
    }

    /// Queues data for the PTY (stdin). Never blocks.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::Exited(self.id.clone()));
        }

        match self.input.try_send(data.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %self.id, bytes = data.len(), "Input backlog full");
                Err(SessionError::InputBacklog(self.id.clone()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(SessionError::WriteFailed("PTY writer closed".to_string()))
            }
        }
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::Exited(self.id.clone()));
        }

        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        self.cols = cols;
        self.rows = rows;

        tracing::debug!(session_id = %self.id, cols, rows, "Resized PTY");

        Ok(())
    }

    /// Kills the shell process. Killing an exited process is a no-op.
    pub fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            tracing::debug!(session_id = %self.id, error = %e, "Kill failed, process likely gone");
        }
    }
}

/// Pumps PTY output into the event channel until EOF, a read error, or the
/// receiver going away.
fn read_loop(session_id: &str, mut reader: Box<dyn Read + Send>, events: &mpsc::Sender<PtyEvent>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %session_id, "PTY EOF");
                break;
            }
            Ok(n) => {
                if events.blocking_send(PtyEvent::Output(buffer[..n].to_vec())).is_err() {
                    tracing::debug!(session_id = %session_id, "Output receiver dropped");
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the slave side closes.
                tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Drains queued input into the PTY until the session is dropped or a
/// write fails.
fn write_loop(
    session_id: &str,
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(session_id = %session_id, error = %e, "PTY write ended");
            break;
        }
    }
}

/// Picks the shell to run.
///
/// Order of preference: the requested shell, the configured default,
/// `$SHELL`, then `/bin/sh`. The chosen shell must exist.
pub fn resolve_shell(
    requested: Option<&str>,
    configured: Option<&str>,
) -> Result<String, SessionError> {
    fn named(s: Option<&str>) -> Option<&str> {
        s.map(str::trim).filter(|s| !s.is_empty())
    }

    let shell = named(requested)
        .or_else(|| named(configured))
        .map(str::to_owned)
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| FALLBACK_SHELL.to_string());

    if !shell_exists(&shell) {
        return Err(SessionError::ShellNotFound(shell));
    }
    Ok(shell)
}

/// Picks the working directory.
///
/// The requested directory (with a leading `~` expanded) if it exists,
/// otherwise the home directory, otherwise `/`.
pub fn resolve_cwd(requested: Option<&str>) -> PathBuf {
    let home = dirs::home_dir();

    if let Some(requested) = requested.map(str::trim).filter(|s| !s.is_empty()) {
        let expanded = match (requested.strip_prefix('~'), &home) {
            (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
                home.join(rest.trim_start_matches('/'))
            }
            _ => PathBuf::from(requested),
        };
        if expanded.is_dir() {
            return expanded;
        }
        tracing::debug!(cwd = %requested, "Requested cwd missing, using home");
    }

    home.filter(|h| h.is_dir())
        .unwrap_or_else(|| PathBuf::from("/"))
}
