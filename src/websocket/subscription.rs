//! Channel subscription registry
//!
//! The registry remembers the exact subscribe command sent for every channel
//! that asked for auto-reconnect, so the same text can be replayed after a
//! reconnect. Entries survive disconnects and only go away on unsubscribe or
//! [`ChannelRegistry::clear`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// A tracked channel and the command that subscribed it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSubscription {
    /// Logical channel/topic identifier
    pub channel_key: String,
    /// Exact text previously sent to subscribe
    pub command: String,
}

/// Replayable subscription state
///
/// Clones share the same map. All mutations go through one mutex; replay
/// works from a [`snapshot`](Self::snapshot) so the lock is never held across
/// a network send.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<BTreeMap<String, String>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `channel_key`, replacing any earlier command for the same key
    pub async fn insert(
        &self,
        channel_key: impl Into<String>,
        command: impl Into<String>,
    ) -> Option<String> {
        let mut channels = self.channels.lock().await;
        channels.insert(channel_key.into(), command.into())
    }

    /// Stop tracking `channel_key`
    pub async fn remove(&self, channel_key: &str) -> bool {
        let mut channels = self.channels.lock().await;
        channels.remove(channel_key).is_some()
    }

    /// Forget every channel
    pub async fn clear(&self) {
        let mut channels = self.channels.lock().await;
        channels.clear();
    }

    pub async fn contains(&self, channel_key: &str) -> bool {
        let channels = self.channels.lock().await;
        channels.contains_key(channel_key)
    }

    /// Stored command for `channel_key`
    pub async fn command(&self, channel_key: &str) -> Option<String> {
        let channels = self.channels.lock().await;
        channels.get(channel_key).cloned()
    }

    pub async fn len(&self) -> usize {
        let channels = self.channels.lock().await;
        channels.len()
    }

    pub async fn is_empty(&self) -> bool {
        let channels = self.channels.lock().await;
        channels.is_empty()
    }

    /// True iff at least one channel is tracked
    pub async fn auto_reconnect(&self) -> bool {
        !self.is_empty().await
    }

    /// Tracked channel keys in replay order
    pub async fn channel_keys(&self) -> Vec<String> {
        let channels = self.channels.lock().await;
        channels.keys().cloned().collect()
    }

    /// Copy of every tracked subscription in replay order (sorted by key)
    pub async fn snapshot(&self) -> Vec<ChannelSubscription> {
        let channels = self.channels.lock().await;
        channels
            .iter()
            .map(|(channel_key, command)| ChannelSubscription {
                channel_key: channel_key.clone(),
                command: command.clone(),
            })
            .collect()
    }
}
