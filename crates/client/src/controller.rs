//! Client session controller.
//!
//! A [`SessionController`] binds one terminal emulator to one broker
//! session. The host drives it through a [`ControllerHandle`]:
//!
//! ```text
//! host UI ──▶ ControllerHandle ──▶ SessionController ──▶ TransportLink ──▶ broker
//!                                        │
//!                                        ▼
//!                                     Emulator
//! ```
//!
//! The controller never reconnects. Once the session exits, fails to start
//! or loses its connection, a status line is shown and input is dropped
//! until the host closes the controller.

use std::time::Duration;

use protocol::{
    ClientEvent, CreateTerminal, ErrorCode, ProtocolError, ServerEvent, SessionMetadata,
    TerminalExit, WireFormat,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::settings::Settings;
use crate::transport::{self, TransportLink};

/// Queued host commands before `send_input` and friends start waiting.
const COMMAND_CAPACITY: usize = 256;

/// Terminal emulator surface the controller renders into.
pub trait Emulator: Send {
    /// Write raw output bytes, escape sequences included.
    fn write(&mut self, data: &[u8]);

    /// Show a one-line status message outside the shell's output.
    fn write_status(&mut self, line: &str);

    fn focus(&mut self);

    /// Release the emulator. Called once, when the controller finishes.
    fn dispose(&mut self);
}

/// Pixel size of one terminal cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontMetrics {
    pub cell_width: f64,
    pub cell_height: f64,
}

impl FontMetrics {
    /// Approximate monospace cell size for a font size in pixels.
    pub fn from_font_size(font_size: f32) -> Self {
        let size = f64::from(font_size.max(1.0));
        Self {
            cell_width: size * 0.6,
            cell_height: size * 1.2,
        }
    }
}

/// Pixel size of the emulator viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

impl ViewportSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Whole cells that fit, at least one in each direction.
    pub fn grid(&self, metrics: &FontMetrics) -> (u16, u16) {
        (
            whole_cells(self.width, metrics.cell_width),
            whole_cells(self.height, metrics.cell_height),
        )
    }
}

fn whole_cells(pixels: f64, cell: f64) -> u16 {
    let cells = (pixels / cell).floor();
    if cells.is_finite() {
        cells.clamp(1.0, f64::from(u16::MAX)) as u16
    } else {
        1
    }
}

/// Connection state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the broker to confirm the session.
    Connecting,
    /// The session is live; input is forwarded.
    Connected,
    /// The session is over. Terminal state.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("could not connect to broker: {0}")]
    Connect(#[source] ProtocolError),
}

/// Controller parameters.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub font_size: f32,
    pub resize_debounce: Duration,
    /// Viewport at start-up.
    pub viewport: ViewportSize,
}

impl ControllerOptions {
    pub fn from_settings(settings: &Settings, viewport: ViewportSize) -> Self {
        Self {
            shell: settings.shell.clone(),
            cwd: settings.cwd.clone(),
            font_size: settings.font_size,
            resize_debounce: settings.timing.resize_debounce(),
            viewport,
        }
    }
}

#[derive(Debug)]
enum Command {
    Input(Vec<u8>),
    Viewport(ViewportSize),
    Focus,
    Close,
}

/// Host-side handle to a running controller.
///
/// Calls on a finished controller are ignored.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ControllerHandle {
    /// Forward keyboard input. Dropped unless the session is connected.
    pub async fn send_input(&self, data: impl Into<Vec<u8>>) {
        let _ = self.commands.send(Command::Input(data.into())).await;
    }

    /// Report a new viewport size. Resizes are debounced.
    pub async fn viewport_changed(&self, size: ViewportSize) {
        let _ = self.commands.send(Command::Viewport(size)).await;
    }

    pub async fn focus(&self) {
        let _ = self.commands.send(Command::Focus).await;
    }

    /// Finish the controller, closing the connection and disposing the
    /// emulator.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Drives one emulator against one broker session.
pub struct SessionController<E: Emulator> {
    emulator: E,
    options: ControllerOptions,
    metrics: FontMetrics,
    viewport: ViewportSize,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    /// Send half of the link; `None` once the session is over.
    outgoing: Option<mpsc::Sender<ClientEvent>>,
    /// Dimensions the broker last confirmed or was last sent.
    sent_dims: (u16, u16),
    session: Option<SessionMetadata>,
}

impl<E: Emulator> SessionController<E> {
    pub fn new(emulator: E, options: ControllerOptions) -> (Self, ControllerHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let metrics = FontMetrics::from_font_size(options.font_size);
        let viewport = options.viewport;
        let controller = Self {
            emulator,
            metrics,
            viewport,
            commands: commands_rx,
            state_tx,
            outgoing: None,
            sent_dims: viewport.grid(&metrics),
            session: None,
            options,
        };
        let handle = ControllerHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (controller, handle)
    }

    /// Connect to the broker at `url` and run until the host closes the
    /// controller.
    ///
    /// A failed connection is shown as a status line, the emulator is
    /// disposed and the error returned.
    pub async fn connect(mut self, url: &str, format: WireFormat) -> Result<(), ControllerError> {
        match transport::connect(url, format).await {
            Ok(link) => {
                self.run(link).await;
                Ok(())
            }
            Err(e) => {
                self.emulator
                    .write_status(&format!("[could not connect to {}: {}]", url, e));
                self.set_state(ConnectionState::Disconnected);
                self.emulator.dispose();
                Err(ControllerError::Connect(e))
            }
        }
    }

    /// Run over an established link until the host closes the controller
    /// or drops every handle.
    pub async fn run(mut self, link: TransportLink) {
        let TransportLink {
            outgoing,
            mut incoming,
        } = link;
        self.outgoing = Some(outgoing);

        let (cols, rows) = self.viewport.grid(&self.metrics);
        self.sent_dims = (cols, rows);
        self.set_state(ConnectionState::Connecting);
        self.send(ClientEvent::CreateTerminal(CreateTerminal {
            shell: self.options.shell.clone(),
            cols,
            rows,
            cwd: self.options.cwd.clone(),
        }))
        .await;

        let debounce = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(debounce);
        let mut resize_pending = false;
        let mut link_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Input(data)) => self.forward_input(data).await,
                    Some(Command::Viewport(size)) => {
                        self.viewport = size;
                        debounce.as_mut().reset(Instant::now() + self.options.resize_debounce);
                        resize_pending = true;
                    }
                    Some(Command::Focus) => self.emulator.focus(),
                    Some(Command::Close) | None => break,
                },
                _ = &mut debounce, if resize_pending => {
                    resize_pending = false;
                    self.flush_resize().await;
                }
                event = incoming.recv(), if link_open => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => {
                        link_open = false;
                        self.connection_lost(&e.to_string());
                    }
                    None => {
                        link_open = false;
                        self.connection_lost("connection ended");
                    }
                },
            }
        }

        self.outgoing = None;
        self.set_state(ConnectionState::Disconnected);
        self.emulator.dispose();
        tracing::debug!(session = ?self.session.as_ref().map(|s| &s.id), "Controller finished");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    async fn send(&mut self, event: ClientEvent) {
        let Some(outgoing) = &self.outgoing else {
            return;
        };
        if outgoing.send(event).await.is_err() {
            self.connection_lost("connection ended");
        }
    }

    async fn forward_input(&mut self, data: Vec<u8>) {
        if self.state() != ConnectionState::Connected {
            tracing::trace!(len = data.len(), "Dropping input while not connected");
            return;
        }
        self.send(ClientEvent::TerminalInput { data }).await;
    }

    /// Send the settled viewport as a resize, unless nothing changed.
    async fn flush_resize(&mut self) {
        let dims = self.viewport.grid(&self.metrics);
        if self.state() != ConnectionState::Connected || dims == self.sent_dims {
            return;
        }
        self.sent_dims = dims;
        self.send(ClientEvent::TerminalResize {
            cols: dims.0,
            rows: dims.1,
        })
        .await;
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::TerminalCreated(meta) => {
                tracing::info!(session_id = %meta.id, shell = %meta.shell, "Terminal session started");
                self.sent_dims = (meta.cols, meta.rows);
                self.session = Some(meta);
                self.set_state(ConnectionState::Connected);
                // Catch up on viewport changes made while connecting.
                self.flush_resize().await;
            }
            ServerEvent::TerminalOutput { data } => self.emulator.write(&data),
            ServerEvent::TerminalExit(exit) => {
                self.emulator.write_status(&exit_status_line(&exit));
                self.end_session();
            }
            ServerEvent::TerminalError(err) => {
                tracing::warn!(code = %err.code, "Broker reported an error: {}", err.error);
                self.emulator.write_status(&format!("[error: {}]", err.error));
                if err.code == ErrorCode::TerminalCreateFailed
                    && self.state() == ConnectionState::Connecting
                {
                    self.end_session();
                }
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        tracing::info!("Broker connection lost: {}", reason);
        self.emulator
            .write_status(&format!("[disconnected: {}]", reason));
        self.end_session();
    }

    /// Enter the terminal state and close the connection.
    fn end_session(&mut self) {
        self.outgoing = None;
        self.set_state(ConnectionState::Disconnected);
    }
}

fn exit_status_line(exit: &TerminalExit) -> String {
    match &exit.signal {
        Some(signal) => format!("[process exited: {}]", signal),
        None => format!("[process exited with code {}]", exit.exit_code),
    }
}
