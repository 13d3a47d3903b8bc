//! WebSocket session transport.
//!
//! Each socket is one connection with its own id and at most one PTY
//! session. Incoming frames are decoded and dispatched by a
//! [`ConnectionHandler`]; outgoing events go through a single writer task
//! draining one queue, so per-connection ordering holds across event kinds.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use protocol::{codec, ClientEvent, ErrorCode, Frame, ServerEvent, WireFormat};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::server::AppState;
use crate::session::{ConnectionId, EventSink, SessionError, SessionManager};

/// Capacity of a connection's outbound event queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// How long the writer may keep flushing after the socket's reader ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Dispatches decoded client events for one connection.
pub struct ConnectionHandler {
    id: ConnectionId,
    manager: Arc<SessionManager>,
    sink: EventSink,
    session_started: bool,
}

impl ConnectionHandler {
    pub fn new(id: ConnectionId, manager: Arc<SessionManager>, sink: EventSink) -> Self {
        Self {
            id,
            manager,
            sink,
            session_started: false,
        }
    }

    /// The connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Decodes and handles one frame. Undecodable frames are answered with
    /// `INVALID_MESSAGE`; the connection stays open.
    pub async fn handle_frame(&mut self, frame: Frame) {
        match codec::decode::<ClientEvent>(&frame) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "Invalid frame");
                self.send(ServerEvent::error(ErrorCode::InvalidMessage, e.to_string()))
                    .await;
            }
        }
    }

    /// Handles one client event.
    pub async fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::CreateTerminal(request) => {
                match self
                    .manager
                    .create(&self.id, request, self.sink.clone())
                    .await
                {
                    Ok(_) => self.session_started = true,
                    Err(e) => {
                        tracing::warn!(connection_id = %self.id, error = %e, "Failed to create terminal");
                        self.send(ServerEvent::error(e.code(), e.to_string())).await;
                    }
                }
            }
            ClientEvent::TerminalInput { data } => {
                if let Err(e) = self.manager.write(&self.id, &data).await {
                    self.report(e).await;
                }
            }
            ClientEvent::TerminalResize { cols, rows } => {
                if let Err(e) = self.manager.resize(&self.id, cols, rows).await {
                    self.report(e).await;
                }
            }
        }
    }

    /// Releases the connection's session. Safe to call more than once.
    pub async fn close(&self) {
        if self.manager.terminate(&self.id).await {
            tracing::debug!(connection_id = %self.id, "Session released on disconnect");
        }
    }

    async fn report(&self, error: SessionError) {
        // Once a session has ended its terminal-exit is the last word.
        if self.session_started && !self.manager.contains(&self.id) {
            tracing::debug!(connection_id = %self.id, error = %error, "Dropping event for ended session");
            return;
        }
        self.send(ServerEvent::error(error.code(), error.to_string()))
            .await;
    }

    async fn send(&self, event: ServerEvent) {
        if self.sink.send(event).await.is_err() {
            tracing::debug!(connection_id = %self.id, "Outbound queue closed");
        }
    }
}

/// WebSocket upgrade handler for `/` and `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Runs one connection until the socket closes or the broker shuts down.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::info!(connection_id = %connection_id, "Client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CAPACITY);
    let (format_tx, format_rx) = watch::channel(WireFormat::default());

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let format = *format_rx.borrow();
            let frame = match codec::encode(format, &event) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(connection_id = %writer_id, error = %e, kind = event.kind(), "Failed to encode event");
                    continue;
                }
            };
            if ws_tx.send(to_message(frame)).await.is_err() {
                tracing::debug!(connection_id = %writer_id, "Socket send failed");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut handler = ConnectionHandler::new(connection_id.clone(), Arc::clone(&state.manager), out_tx);

    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            message = ws_rx.next() => message,
        };

        let frame = match message {
            Some(Ok(Message::Text(text))) => Frame::Text(text),
            Some(Ok(Message::Binary(bytes))) => Frame::Binary(bytes),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Socket error");
                break;
            }
        };

        format_tx.send_replace(frame.format());
        handler.handle_frame(frame).await;
    }

    handler.close().await;
    drop(handler);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::debug!(connection_id = %connection_id, "Writer did not drain in time");
    }
    tracing::info!(connection_id = %connection_id, "Client disconnected");
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
    }
}
