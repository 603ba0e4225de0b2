//! Transport Seam
//!
//! The connection manager never touches a socket directly. A [`Connector`]
//! opens a transport and hands back a [`TransportLink`]: a pair of channels
//! carrying outbound and inbound frames. [`WsConnector`] is the production
//! implementation on top of tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::config::ConnectionConfig;
use super::error::{ConnectionError, ConnectionResult};

/// Frame written to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Frame read from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    /// Transport-level pong
    Pong,
    /// The peer closed the connection; `None` when no status code was given
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// An open transport
///
/// Dropping `outbound` closes the underlying connection.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Opens transports for the connection manager
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> ConnectionResult<TransportLink>;
}

/// WebSocket connector using tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &ConnectionConfig) -> ConnectionResult<TransportLink> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;

        if !config.protocols.is_empty() {
            let value = HeaderValue::from_str(&config.protocols.join(", "))
                .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();

        // Write pump: ends when the manager drops its sender or after a close frame
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let (message, closing) = match frame {
                    OutboundFrame::Text(text) => (WsMessage::Text(text.into()), false),
                    OutboundFrame::Close { code, reason } => (
                        WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })),
                        true,
                    ),
                };

                if let Err(e) = write.send(message).await {
                    tracing::debug!(error = %e, "WebSocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Read pump: ends on close, error, or when the manager drops its receiver
        tokio::spawn(async move {
            while let Some(next) = read.next().await {
                let frame = match next {
                    Ok(WsMessage::Text(text)) => InboundFrame::Text(text.as_str().to_owned()),
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => InboundFrame::Text(text),
                        Err(_) => {
                            tracing::debug!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Pong(_)) => InboundFrame::Pong,
                    Ok(WsMessage::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                            .unwrap_or((None, String::new()));
                        let _ = inbound_tx.send(InboundFrame::Closed { code, reason });
                        return;
                    }
                    // Pings are answered by tungstenite itself
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(InboundFrame::Error(e.to_string()));
                        return;
                    }
                };

                if inbound_tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(InboundFrame::Closed {
                code: None,
                reason: "stream ended".to_string(),
            });
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
