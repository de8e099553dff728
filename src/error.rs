//! Error types for the channel stream client

use thiserror::Error;

use crate::websocket::ConnectionState;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the channel stream client
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Signing error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Invalid parameter error
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// WebSocket handshake or stream error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A frame was sent while the connection was not open
    #[error("Connection is not open (state: {0})")]
    NotOpen(ConnectionState),

    /// Reconnect attempt finished without an open connection
    #[error("Reconnect failed (state: {0})")]
    RecoveryFailed(ConnectionState),

    /// The connection dropped again while subscriptions were being replayed
    #[error("Replay interrupted with {remaining} subscription(s) left")]
    ReplayInterrupted { remaining: usize },
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Io(io_err) => Error::WebSocket(format!("IO error: {io_err}")),
            WsError::Tls(tls_err) => Error::WebSocket(format!("TLS error: {tls_err}")),
            WsError::ConnectionClosed => Error::WebSocket("Connection closed".to_string()),
            WsError::AlreadyClosed => Error::WebSocket("Already closed".to_string()),
            WsError::Protocol(p) => Error::WebSocket(format!("Protocol error: {p}")),
            WsError::Url(u) => Error::WebSocket(format!("URL error: {u}")),
            WsError::Http(resp) => Error::WebSocket(format!("HTTP error: status {}", resp.status())),
            WsError::HttpFormat(e) => Error::WebSocket(format!("HTTP format error: {e}")),
            other => Error::WebSocket(other.to_string()),
        }
    }
}
