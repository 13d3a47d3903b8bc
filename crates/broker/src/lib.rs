//! # termbridge broker library
//!
//! The broker gives a local host application interactive shells: it spawns
//! PTY-backed processes on request and streams their I/O over a WebSocket.
//!
//! ## Overview
//!
//! - **PTY Session Manager**: one shell per transport connection
//! - **Session Transport**: typed events over `ws://host:port/`
//! - **Health Endpoint**: `GET /health` liveness and session count
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      BrokerServer                      │
//! ├────────────────────────────────────────────────────────┤
//! │  GET /health ──▶ health ──┐                            │
//! │                           ▼                            │
//! │  WS / ──▶ transport ──▶ SessionManager ──▶ PTY + shell │
//! │              ▲              │                          │
//! │              └── events ◀───┘  (one reader per PTY)    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use broker::{BrokerServer, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = BrokerServer::new(Config::load_default()?);
//!     let addr = server.start().await?;
//!     println!("listening on ws://{}/", addr);
//!
//!     // ... wait for a shutdown signal ...
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod health;
pub mod pidfile;
pub mod server;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError, DEFAULT_PORT};
pub use server::{AppState, BrokerServer, ServerState};
pub use session::{ConnectionId, SessionError, SessionId, SessionInfo, SessionManager};
