//! WebSocket connector built on `tokio-tungstenite`

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::Error as WsError;

use crate::error::{ChatFlowError, Result};

use super::{Connector, Link, LinkEvent, OutboundFrame};

/// Connector opening real WebSocket links (`ws://` and `wss://`)
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new WebSocket connector
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn open_impl(url: &str, handshake_timeout: Duration) -> Result<Link> {
        let request = url.into_client_request().map_err(|e| {
            ChatFlowError::connection_failed(format!("Failed to build WebSocket request: {e}"))
        })?;

        let stream = match tokio::time::timeout(handshake_timeout, connect_async(request)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(WsError::Http(response))) => {
                return Err(ChatFlowError::connection_failed(format!(
                    "WebSocket upgrade rejected with HTTP {}",
                    response.status()
                )));
            }
            Ok(Err(e)) => {
                return Err(ChatFlowError::connection_failed(format!(
                    "WebSocket connect failed: {e}"
                )));
            }
            Err(_) => {
                return Err(ChatFlowError::connection_timeout(format!(
                    "handshake did not complete within {} ms",
                    handshake_timeout.as_millis()
                )));
            }
        };

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<LinkEvent>();

        // Writer: drains outbound frames until closed or the socket fails
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            log::debug!("WebSocket write failed: {e}");
                            break;
                        }
                    }
                    OutboundFrame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forwards text frames, then exactly one Closed event
        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(LinkEvent::Text(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if inbound_tx.send(LinkEvent::Text(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", bytes.len()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| format!("{} {}", f.code, f.reason.as_str()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = inbound_tx.send(LinkEvent::Closed(reason));
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

impl Connector for WebSocketConnector {
    fn open<'a>(&'a self, url: &'a str, handshake_timeout: Duration) -> BoxFuture<'a, Result<Link>> {
        Self::open_impl(url, handshake_timeout).boxed()
    }
}
