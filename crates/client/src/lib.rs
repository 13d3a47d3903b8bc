//! # termbridge client library
//!
//! Host-side pieces of termbridge: keeping a broker running and binding a
//! terminal emulator to a broker session.
//!
//! ## Overview
//!
//! - **Settings**: persisted user settings (`settings.toml`)
//! - **Supervisor**: locate, launch and health-check the broker process
//! - **Controller**: one emulator ↔ one PTY session over WebSocket
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Host app                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  SettingsStore ──▶ Supervisor ──spawn──▶ termbridge-broker   │
//! │                        │                        ▲            │
//! │                        └──── GET /health ───────┤            │
//! │                                                 │            │
//! │  Emulator ◀──▶ SessionController ◀── ws:// ─────┘            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use client::controller::{ControllerOptions, SessionController, ViewportSize};
//! use client::settings::SettingsStore;
//! use client::supervisor::Supervisor;
//! use protocol::WireFormat;
//!
//! let store = SettingsStore::load_default()?;
//! let settings = store.settings();
//!
//! let supervisor = Supervisor::from_settings(settings, Some(plugin_data_dir))?;
//! supervisor.ensure_running().await?;
//!
//! let options = ControllerOptions::from_settings(settings, ViewportSize::new(800.0, 600.0));
//! let (controller, handle) = SessionController::new(my_emulator, options);
//! tokio::spawn(controller.connect(&settings.server_url, WireFormat::Json));
//! handle.send_input("ls\n").await;
//! ```

pub mod controller;
pub mod settings;
pub mod supervisor;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use controller::{
    ConnectionState, ControllerError, ControllerHandle, ControllerOptions, Emulator, FontMetrics,
    SessionController, ViewportSize,
};
pub use settings::{RuntimePath, Settings, SettingsError, SettingsStore};
pub use supervisor::{Supervisor, SupervisorError, SupervisorState};
pub use transport::TransportLink;
