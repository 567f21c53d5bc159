//! Transport layer for the physical socket
//!
//! A [`Connector`] opens one physical link and hands back a [`Link`]: an
//! outbound frame sender and an inbound event receiver, each serviced by
//! background tasks. The connection layer never touches the socket itself,
//! which keeps reconnection and heartbeat logic independent of the
//! transport and lets tests drive connections through [`memory`].

pub mod memory;
pub mod websocket;

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;

/// Frame written to the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Text frame
    Text(String),
    /// Close the socket
    Close,
}

/// Event read from the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Text frame
    Text(String),
    /// Socket closed, with the reason when one is known
    Closed(Option<String>),
}

/// One open physical link
///
/// Dropping the outbound sender or sending [`OutboundFrame::Close`] closes
/// the socket. The inbound receiver yields [`LinkEvent::Closed`] exactly
/// once, as its last event, whatever side closed the link.
#[derive(Debug)]
pub struct Link {
    /// Frames to write
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    /// Frames and close notification read from the socket
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens physical links
///
/// Implementations must fail with `ConnectionFailed` for transport errors
/// and rejected upgrades, and with `ConnectionTimeout` when the handshake
/// does not finish within `handshake_timeout`.
pub trait Connector: Send + Sync + 'static {
    /// Open a link to `url`
    fn open<'a>(&'a self, url: &'a str, handshake_timeout: Duration) -> BoxFuture<'a, Result<Link>>;
}

pub use memory::{MemoryConnector, MemoryServer};
pub use websocket::WebSocketConnector;
