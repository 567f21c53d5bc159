//! In-memory connector
//!
//! Every successful [`MemoryConnector::open`] produces a [`MemoryServer`]
//! holding the far end of the link, so a test (or an embedding application)
//! can play the server side of the protocol without a network.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{ChatFlowError, Result};
use crate::message::HEARTBEAT_FRAME;

use super::{Connector, Link, LinkEvent, OutboundFrame};

/// Server side of one in-memory link
#[derive(Debug)]
pub struct MemoryServer {
    /// URL the client opened
    pub url: String,
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl MemoryServer {
    /// Send a raw text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(LinkEvent::Text(text.into())).is_ok()
    }

    /// Send a JSON frame to the client
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Close the link from the server side
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.to_client.send(LinkEvent::Closed(Some(reason.into())));
    }

    /// Next frame written by the client, heartbeats included
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
    }

    /// Next JSON request written by the client, skipping heartbeats
    ///
    /// Returns `None` once the client closed the link.
    pub async fn recv_request(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.from_client.recv().await? {
                OutboundFrame::Text(text) if text == HEARTBEAT_FRAME => {}
                OutboundFrame::Text(text) => return serde_json::from_str(&text).ok(),
                OutboundFrame::Close => return None,
            }
        }
    }
}

/// Connector whose links are served in-process
#[derive(Debug)]
pub struct MemoryConnector {
    opens: AtomicUsize,
    handshake_delay: Mutex<Duration>,
    failures: Mutex<VecDeque<ChatFlowError>>,
    servers_tx: mpsc::UnboundedSender<MemoryServer>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryServer>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Create a new in-memory connector
    #[must_use]
    pub fn new() -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            opens: AtomicUsize::new(0),
            handshake_delay: Mutex::new(Duration::ZERO),
            failures: Mutex::new(VecDeque::new()),
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
        }
    }

    /// Number of handshakes attempted so far
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Delay every handshake by `delay`
    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.handshake_delay.lock() = delay;
    }

    /// Make the next handshake fail with `error`
    pub fn fail_next(&self, error: ChatFlowError) {
        self.failures.lock().push_back(error);
    }

    /// Wait for the server side of the next opened link
    pub async fn accept(&self) -> Option<MemoryServer> {
        self.servers_rx.lock().await.recv().await
    }

    async fn open_impl(&self, url: &str, handshake_timeout: Duration) -> Result<Link> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.handshake_delay.lock();
        if delay > handshake_timeout {
            tokio::time::sleep(handshake_timeout).await;
            return Err(ChatFlowError::connection_timeout(format!(
                "handshake did not complete within {} ms",
                handshake_timeout.as_millis()
            )));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let server = MemoryServer {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.servers_tx
            .send(server)
            .map_err(|_| ChatFlowError::connection_failed("memory connector shut down"))?;
        Ok(Link { outbound, inbound })
    }
}

impl Connector for MemoryConnector {
    fn open<'a>(&'a self, url: &'a str, handshake_timeout: Duration) -> BoxFuture<'a, Result<Link>> {
        self.open_impl(url, handshake_timeout).boxed()
    }
}
