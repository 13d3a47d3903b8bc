//! Client side of the session transport.
//!
//! [`connect`] opens a WebSocket to the broker and hands back a pair of
//! channels. Dropping the outgoing sender closes the socket, which makes
//! the broker tear the session down.

use futures_util::{SinkExt, StreamExt};
use protocol::{codec, ClientEvent, Frame, ProtocolError, ServerEvent, WireFormat};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

/// Buffered events per direction.
const CHANNEL_CAPACITY: usize = 256;

/// Channels bound to one broker connection.
///
/// The incoming side yields `Err(ConnectionClosed)` once when the socket
/// ends, then `None`.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::Sender<ClientEvent>,
    pub incoming: mpsc::Receiver<Result<ServerEvent, ProtocolError>>,
}

impl TransportLink {
    /// An in-memory link plus the far ends of its channels.
    pub fn pair() -> (
        TransportLink,
        mpsc::Receiver<ClientEvent>,
        mpsc::Sender<Result<ServerEvent, ProtocolError>>,
    ) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            TransportLink {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
            },
            outgoing_rx,
            incoming_tx,
        )
    }
}

/// Connect to the broker at `url`, sending frames in `format`.
pub async fn connect(url: &str, format: WireFormat) -> Result<TransportLink, ProtocolError> {
    tracing::info!("Connecting to broker: {}", url);

    let (ws_stream, _) = connect_async(url).await.map_err(|e| match e {
        WsError::Io(io_err) => ProtocolError::ConnectionClosed(io_err.to_string()),
        _ => ProtocolError::ConnectionClosed(format!("WebSocket connection failed: {}", e)),
    })?;

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientEvent>(CHANNEL_CAPACITY);
    let (incoming_tx, incoming_rx) =
        mpsc::channel::<Result<ServerEvent, ProtocolError>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Some(event) = outgoing_rx.recv().await {
            let message = match codec::encode(format, &event) {
                Ok(frame) => to_message(frame),
                Err(e) => {
                    tracing::error!("Failed to encode {:?}: {}", event, e);
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(message).await {
                tracing::debug!("Failed to send WebSocket message: {}", e);
                return;
            }
        }
        let _ = ws_sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(result) = ws_stream.next().await {
            let frame = match result {
                Ok(WsMessage::Text(text)) => Frame::Text(text),
                Ok(WsMessage::Binary(bytes)) => Frame::Binary(bytes),
                Ok(WsMessage::Close(_)) => {
                    let _ = incoming_tx
                        .send(Err(ProtocolError::ConnectionClosed(
                            "broker closed connection".to_string(),
                        )))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = incoming_tx
                        .send(Err(ProtocolError::ConnectionClosed(format!(
                            "WebSocket error: {}",
                            e
                        ))))
                        .await;
                    return;
                }
                _ => continue,
            };
            match codec::decode::<ServerEvent>(&frame) {
                Ok(event) => {
                    if incoming_tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!("Ignoring malformed broker frame: {}", e),
            }
        }
        let _ = incoming_tx
            .send(Err(ProtocolError::ConnectionClosed(
                "connection ended".to_string(),
            )))
            .await;
    });

    Ok(TransportLink {
        outgoing: outgoing_tx,
        incoming: incoming_rx,
    })
}

fn to_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Binary(bytes) => WsMessage::Binary(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::config::Config;
    use broker::server::BrokerServer;
    use protocol::CreateTerminal;
    use std::time::Duration;

    async fn start_broker() -> (BrokerServer, String) {
        let mut config = Config::default();
        config.server.port = 0;
        let mut server = BrokerServer::new(config);
        let addr = server.start().await.unwrap();
        (server, format!("ws://{}/", addr))
    }

    async fn next(link: &mut TransportLink) -> Result<ServerEvent, ProtocolError> {
        tokio::time::timeout(Duration::from_secs(5), link.incoming.recv())
            .await
            .expect("timed out waiting for broker")
            .expect("link closed")
    }

    #[tokio::test]
    async fn test_create_over_both_formats() {
        let (server, url) = start_broker().await;

        for format in [WireFormat::Json, WireFormat::MessagePack] {
            let mut link = connect(&url, format).await.unwrap();
            link.outgoing
                .send(ClientEvent::CreateTerminal(CreateTerminal {
                    shell: Some("/bin/sh".to_string()),
                    ..CreateTerminal::default()
                }))
                .await
                .unwrap();
            match next(&mut link).await {
                Ok(ServerEvent::TerminalCreated(meta)) => assert_eq!(meta.shell, "/bin/sh"),
                other => panic!("Expected terminal-created, got {:?}", other),
            }
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_sender_releases_session() {
        let (server, url) = start_broker().await;
        let mut link = connect(&url, WireFormat::Json).await.unwrap();
        link.outgoing
            .send(ClientEvent::CreateTerminal(CreateTerminal::default()))
            .await
            .unwrap();
        assert!(matches!(
            next(&mut link).await,
            Ok(ServerEvent::TerminalCreated(_))
        ));
        assert_eq!(server.manager().count(), 1);

        drop(link);

        let mut released = false;
        for _ in 0..50 {
            if server.manager().count() == 0 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(released);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_shutdown_reports_closed() {
        let (server, url) = start_broker().await;
        let mut link = connect(&url, WireFormat::Json).await.unwrap();

        server.stop().await.unwrap();

        assert!(matches!(
            next(&mut link).await,
            Err(ProtocolError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            connect(&format!("ws://{}/", addr), WireFormat::Json).await,
            Err(ProtocolError::ConnectionClosed(_))
        ));
    }
}
