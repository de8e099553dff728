//! WebSocket channel streaming
//!
//! This module provides a subscription client for servers that push messages
//! over a single WebSocket. It handles connection management, heartbeat
//! pings, message dispatch, and transparent recovery: when the connection
//! closes, channels subscribed with auto-reconnect are replayed onto a fresh
//! socket, and a recovered closure is not reported.
//!
//! # Example
//!
//! ```ignore
//! use channel_stream::websocket::{ClientEvent, NoopHandler, StreamClient};
//! use channel_stream::ClientConfig;
//!
//! let client = StreamClient::new(ClientConfig::new("wss://example.com/ws"), NoopHandler)?;
//! client.connect().await?;
//!
//! // Subscribe and keep the command for replay
//! client.subscribe("ticker.BTC", r#"{"type":"subscribe","channelId":"ticker.BTC"}"#, true).await?;
//!
//! // Lifecycle events the client could not absorb
//! while let Some(event) = client.recv().await {
//!     // Handle event
//! }
//! ```

mod client;
mod dispatcher;
#[cfg(test)]
pub(crate) mod mock;
mod reconnect;
mod subscription;
mod transport;

pub use client::{ClientEvent, StreamClient};
pub use dispatcher::{DispatchMode, Dispatcher, MessageDisposition, MessageHandler, NoopHandler};
pub use reconnect::{ReconnectController, RecoveryOutcome};
pub use subscription::{ChannelRegistry, ChannelSubscription};
pub use transport::{ConnectionState, Transport, TransportEvent, WsTransport};
