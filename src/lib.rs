//! Channel streaming client
//!
//! A Rust client for WebSocket servers that multiplex many logical channels
//! over one connection, including:
//! - Subscribe/unsubscribe commands, with optional HMAC-signed private channels
//! - Transparent reconnect that replays tracked subscriptions
//! - Background message dispatch to an application handler

pub mod auth;
pub mod config;
pub mod error;
pub mod types;
pub mod websocket;

pub use auth::{Authenticator, HmacSigner, NonceGenerator, Signer};
pub use config::{ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE};
pub use error::{Error, Result};
pub use types::*;
pub use websocket::{ClientEvent, ConnectionState, MessageHandler, StreamClient};
