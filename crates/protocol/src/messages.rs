//! Session protocol events.
//!
//! Every frame on the transport carries exactly one event. The event name
//! travels in the `type` field (`create-terminal`, `terminal-output`, ...)
//! and the remaining fields are camelCase, so the JSON form reads:
//!
//! ```json
//! {"type":"terminal-resize","cols":120,"rows":40}
//! ```

use serde::{Deserialize, Serialize};

/// Default terminal width used when a client does not say otherwise.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a client does not say otherwise.
pub const DEFAULT_ROWS: u16 = 24;

/// Events sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Request a new PTY session for this connection.
    CreateTerminal(CreateTerminal),
    /// Raw keyboard/paste input for the session.
    TerminalInput {
        #[serde(with = "crate::bytes")]
        data: Vec<u8>,
    },
    /// New terminal dimensions.
    TerminalResize { cols: u16, rows: u16 },
}

/// Events sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// The session was spawned.
    TerminalCreated(SessionMetadata),
    /// A chunk of PTY output. Chunk boundaries carry no meaning.
    TerminalOutput {
        #[serde(with = "crate::bytes")]
        data: Vec<u8>,
    },
    /// The shell process ended. Always the last event of a session.
    TerminalExit(TerminalExit),
    /// A request on this connection failed.
    TerminalError(TerminalError),
}

impl ServerEvent {
    /// Builds an output event.
    pub fn output(data: Vec<u8>) -> Self {
        ServerEvent::TerminalOutput { data }
    }

    /// Builds an error event.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::TerminalError(TerminalError {
            error: message.into(),
            code,
        })
    }

    /// Short event name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::TerminalCreated(_) => "terminal-created",
            ServerEvent::TerminalOutput { .. } => "terminal-output",
            ServerEvent::TerminalExit(_) => "terminal-exit",
            ServerEvent::TerminalError(_) => "terminal-error",
        }
    }
}

/// Parameters of a `create-terminal` request.
///
/// Every field is optional on the wire; missing dimensions fall back to
/// 80x24 and missing shell/cwd are resolved by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTerminal {
    /// Shell command to run. `None` means the broker default.
    pub shell: Option<String>,
    /// Requested terminal columns.
    pub cols: u16,
    /// Requested terminal rows.
    pub rows: u16,
    /// Working directory. `None` means the user's home directory.
    pub cwd: Option<String>,
}

impl Default for CreateTerminal {
    fn default() -> Self {
        Self {
            shell: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
        }
    }
}

/// Metadata returned once a session is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Broker-assigned session identifier.
    pub id: String,
    /// The shell that was actually spawned.
    pub shell: String,
    /// The working directory that was actually used.
    pub cwd: String,
    /// Actual terminal columns.
    pub cols: u16,
    /// Actual terminal rows.
    pub rows: u16,
    /// Process ID of the shell, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Exit status of a session's shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExit {
    /// Process exit code.
    pub exit_code: u32,
    /// Signal description if the process was killed by a signal.
    pub signal: Option<String>,
}

/// Error reported to the connection that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalError {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code.
    pub code: ErrorCode,
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Spawning the PTY failed (shell missing, spawn error, limit reached).
    TerminalCreateFailed,
    /// Input or resize arrived while the connection owns no session.
    NoTerminal,
    /// The frame could not be decoded.
    InvalidMessage,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::TerminalCreateFailed => "TERMINAL_CREATE_FAILED",
            ErrorCode::NoTerminal => "NO_TERMINAL",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
        };
        f.write_str(s)
    }
}
