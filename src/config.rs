//! Client configuration

use std::time::Duration;

use crate::error::{Error, Result};
use crate::websocket::DispatchMode;

/// Default heartbeat interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Default handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for a [`StreamClient`](crate::websocket::StreamClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Streaming endpoint (`ws://` or `wss://`)
    pub url: String,
    /// Interval between heartbeat pings, `None` disables the heartbeat
    pub keep_alive: Option<Duration>,
    /// Maximum time allowed for the opening handshake
    pub connect_timeout: Duration,
    /// Log every inbound and outbound frame at debug level
    pub verbose: bool,
    /// How arrived messages are handed to the application
    pub dispatch_mode: DispatchMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            verbose: false,
            dispatch_mode: DispatchMode::Background,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given endpoint
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the heartbeat interval
    pub fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the handshake timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable per-frame logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the dispatch mode
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Check the configuration before any connection is attempted
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::InvalidParameter("url must not be empty".to_string()));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(Error::InvalidParameter(format!(
                "url must use the ws:// or wss:// scheme, got {}",
                self.url
            )));
        }
        if self.keep_alive.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidParameter(
                "keep-alive interval must be > 0".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "connect timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
