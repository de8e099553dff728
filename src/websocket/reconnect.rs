//! Recovery after a closed connection
//!
//! One closure event gets at most one reconnect attempt. There is no retry
//! loop or backoff here; a failed recovery is handed back to the application.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::subscription::ChannelRegistry;
use super::transport::{ConnectionState, Transport};

/// Result of one recovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No channels were tracked, so the closure is final
    NothingToReplay,
    /// The transport is being disposed
    Disposed,
    /// Reconnected and re-sent this many commands
    Replayed(usize),
    /// The reconnect attempt ended in a state other than `Open`
    ReconnectFailed(ConnectionState),
    /// The connection dropped again part-way through the replay
    ReplayInterrupted { replayed: usize, remaining: usize },
}

impl RecoveryOutcome {
    /// Whether the closure was absorbed and the application need not hear of it
    pub fn is_recovered(&self) -> bool {
        matches!(self, RecoveryOutcome::Replayed(_))
    }
}

/// Reconnects a transport and replays the registry onto it
#[derive(Debug)]
pub struct ReconnectController<T: Transport> {
    transport: Arc<T>,
    registry: ChannelRegistry,
}

impl<T: Transport> ReconnectController<T> {
    pub fn new(transport: Arc<T>, registry: ChannelRegistry) -> Self {
        Self {
            transport,
            registry,
        }
    }

    /// Run the recovery sequence for one closure event.
    ///
    /// The channels replayed are the ones tracked once the connection is open
    /// again, and each entry is read back from the registry right before it is
    /// sent. Callers must not run two recoveries at once for the same
    /// transport.
    pub async fn recover(&self) -> RecoveryOutcome {
        if self.transport.is_disposing() {
            return RecoveryOutcome::Disposed;
        }

        if self.registry.is_empty().await {
            info!("connection closed with no tracked channels");
            return RecoveryOutcome::NothingToReplay;
        }

        let state = match self.transport.state() {
            // someone reconnected before this closure was handled
            ConnectionState::Open => ConnectionState::Open,
            _ => match self.transport.reconnect().await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "reconnect attempt failed");
                    self.transport.state()
                }
            },
        };

        if self.transport.is_disposing() {
            return RecoveryOutcome::Disposed;
        }

        if state != ConnectionState::Open {
            error!(%state, "recovery failed");
            return RecoveryOutcome::ReconnectFailed(state);
        }

        let channel_keys = self.registry.channel_keys().await;
        let total = channel_keys.len();
        let mut replayed = 0;
        for (position, channel_key) in channel_keys.iter().enumerate() {
            let remaining = total - position;

            let state = self.transport.state();
            if state != ConnectionState::Open {
                warn!(%state, replayed, remaining, "connection lost during replay");
                return RecoveryOutcome::ReplayInterrupted {
                    replayed,
                    remaining,
                };
            }

            // unsubscribed or cleared since the keys were listed
            let Some(command) = self.registry.command(channel_key).await else {
                continue;
            };

            if let Err(e) = self.transport.send(&command).await {
                warn!(
                    channel = %channel_key,
                    error = %e,
                    replayed,
                    remaining,
                    "replay send failed"
                );
                return RecoveryOutcome::ReplayInterrupted {
                    replayed,
                    remaining,
                };
            }
            replayed += 1;
        }

        info!(replayed, "subscriptions replayed");
        RecoveryOutcome::Replayed(replayed)
    }
}
