//! # termbridge protocol
//!
//! Wire definitions shared by the broker and its clients.
//!
//! ## Overview
//!
//! - **Events**: typed client→server and server→client session events
//! - **Codec**: JSON text frames or MessagePack binary frames
//! - **Health**: the `GET /health` payload
//!
//! ```text
//! client                                   broker
//!   │ ── create-terminal{shell,cols,rows,cwd} ──▶ │
//!   │ ◀──── terminal-created{id,shell,cwd,..} ─── │
//!   │ ── terminal-input{data} ──────────────────▶ │
//!   │ ◀──────────────── terminal-output{data} ─── │  (repeats)
//!   │ ── terminal-resize{cols,rows} ────────────▶ │
//!   │ ◀───────────── terminal-exit{exitCode,..} ─ │  (last)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use protocol::{codec, ClientEvent, CreateTerminal, WireFormat};
//!
//! let event = ClientEvent::CreateTerminal(CreateTerminal::default());
//! let frame = codec::encode(WireFormat::Json, &event).unwrap();
//! let back: ClientEvent = codec::decode(&frame).unwrap();
//! assert_eq!(back, event);
//! ```

pub mod bytes;
pub mod codec;
pub mod error;
pub mod health;
pub mod messages;

pub use codec::{Frame, WireFormat, MAX_FRAME_SIZE};
pub use error::{ProtocolError, Result};
pub use health::{HealthSnapshot, MemoryUsage, STATUS_OK};
pub use messages::{
    ClientEvent, CreateTerminal, ErrorCode, ServerEvent, SessionMetadata, TerminalError,
    TerminalExit, DEFAULT_COLS, DEFAULT_ROWS,
};
