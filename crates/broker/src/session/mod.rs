//! Session management module.
//!
//! This module provides PTY spawning and the per-connection session
//! registry: sessions are created, written to, resized and terminated on
//! behalf of one transport connection each.

pub mod manager;
pub mod pty;

pub use manager::{EventSink, SessionInfo, SessionManager};
pub use pty::{
    resolve_cwd, resolve_shell, ConnectionId, PtyEvent, Session, SessionError, SessionId,
    SpawnOptions, OUTPUT_CHANNEL_CAPACITY,
};
