//! Error types for the chat/workflow client

use thiserror::Error;

/// Main error type for the chat/workflow client
///
/// Errors are `Clone` because one failure is often observed by several
/// parties at once: every caller awaiting the same pending connect, the
/// stream consumer and the error callback of a failed request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatFlowError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake did not complete in time
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    /// Connection was explicitly closed
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Frame could not be written
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// No (further) response arrived within the response timeout
    #[error("Response timed out after {0} ms")]
    ResponseTimeout(u64),

    /// Inbound frame could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Request could not be built or dispatched
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// A request is already in flight for the session
    #[error("A request is already in progress for session {0}")]
    RequestInProgress(String),

    /// Session bookkeeping error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Workflow run is not running
    #[error("Workflow is not running (state: {0})")]
    NotRunning(String),

    /// Workflow run is not waiting for input
    #[error("Workflow is not waiting for input (state: {0})")]
    NotWaiting(String),

    /// Error reported by the server
    #[error("Server error {code}: {message}")]
    ServerError {
        /// Status code reported by the server
        code: String,
        /// Message reported by the server
        message: String,
    },

    /// Anything unrecognised
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ChatFlowError>;

impl ChatFlowError {
    /// Create a connection failed error
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Create a connection timeout error
    pub fn connection_timeout(msg: impl Into<String>) -> Self {
        Self::ConnectionTimeout(msg.into())
    }

    /// Create a connection closed error
    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    /// Create a send failed error
    pub fn send_failed(msg: impl Into<String>) -> Self {
        Self::SendFailed(msg.into())
    }

    /// Create an invalid response error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a request failed error
    pub fn request_failed(msg: impl Into<String>) -> Self {
        Self::RequestFailed(msg.into())
    }

    /// Create a request-in-progress error
    pub fn request_in_progress(session_id: impl Into<String>) -> Self {
        Self::RequestInProgress(session_id.into())
    }

    /// Create a session error
    pub fn session(msg: impl Into<String>) -> Self {
        Self::SessionError(msg.into())
    }

    /// Create a server error
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServerError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create an unknown error
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Wrap a caught panic payload
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Self::Unknown(msg)
    }

    /// Whether this error ends the connection rather than a single request
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ConnectionTimeout(_) | Self::ConnectionClosed(_)
        )
    }
}

impl From<serde_json::Error> for ChatFlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatFlowError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::ConnectionFailed(err.to_string())
    }
}

impl From<url::ParseError> for ChatFlowError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidConfig(format!("invalid url: {err}"))
    }
}
