//! Outbound command envelopes
//!
//! Every command is built fresh per send and serialized to a single-line JSON
//! payload before it reaches the transport.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Converts a command into the exact text frame sent on the wire
pub trait ToText {
    /// Serialize to wire text
    fn to_text(&self) -> Result<String>;
}

impl<T: Serialize + ?Sized> ToText for T {
    fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Kind of command sent to the streaming endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    /// Start receiving a channel
    Subscribe,
    /// Stop receiving a channel
    Unsubscribe,
    /// Application-level keep-alive
    Ping,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::Subscribe => write!(f, "subscribe"),
            CommandType::Unsubscribe => write!(f, "unsubscribe"),
            CommandType::Ping => write!(f, "ping"),
        }
    }
}

/// Public channel command envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCommand {
    /// Command kind
    #[serde(rename = "type")]
    pub command_type: CommandType,
    /// Channel identifier
    pub channel_id: String,
    /// Optional correlation id echoed back by the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ChannelCommand {
    /// Create a command of the given type
    pub fn new(command_type: CommandType, channel_id: impl Into<String>) -> Self {
        Self {
            command_type,
            channel_id: channel_id.into(),
            request_id: None,
        }
    }

    /// Create a subscribe command
    pub fn subscribe(channel_id: impl Into<String>) -> Self {
        Self::new(CommandType::Subscribe, channel_id)
    }

    /// Create an unsubscribe command
    pub fn unsubscribe(channel_id: impl Into<String>) -> Self {
        Self::new(CommandType::Unsubscribe, channel_id)
    }

    /// Attach a request id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Command envelope for channels that require a signature
///
/// Built through [`crate::auth::Authenticator::sign_command`], which fills in
/// the nonce payload, public key and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChannelCommand {
    #[serde(flatten)]
    pub command: ChannelCommand,
    /// Public key of the signer
    pub public_key: String,
    /// Signed payload (`nonce=<nonce>`)
    pub payload: String,
    /// Signature over `payload`
    pub signature: String,
}

impl PrivateChannelCommand {
    /// Channel identifier of the wrapped command
    pub fn channel_id(&self) -> &str {
        &self.command.channel_id
    }
}
