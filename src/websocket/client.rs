//! Channel streaming client
//!
//! [`StreamClient`] ties the pieces together: it sends subscribe and
//! unsubscribe commands through the transport, keeps the registry of
//! replayable channels, and runs a controller task that consumes transport
//! events in order. Messages go to the [`MessageHandler`]; lifecycle
//! notifications come out of [`StreamClient::recv`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use super::dispatcher::{Dispatcher, MessageHandler};
use super::reconnect::{ReconnectController, RecoveryOutcome};
use super::subscription::ChannelRegistry;
use super::transport::{ConnectionState, Transport, TransportEvent, WsTransport};
use crate::auth::Authenticator;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{ChannelCommand, ToText};

/// Lifecycle notification delivered to the application
#[derive(Debug)]
pub enum ClientEvent {
    /// The connection is gone and was not recovered.
    ///
    /// Carries `None` for a plain close with nothing to replay, or the reason
    /// recovery did not succeed.
    ConnectionClosed(Option<Error>),
    /// The reader stopped on an error; no recovery is attempted
    ConnectionError(Error),
    /// A closure was absorbed: reconnected and replayed this many channels
    Reconnected { replayed: usize },
}

struct Inner<T: Transport> {
    transport: Arc<T>,
    registry: ChannelRegistry,
    dispatcher: Dispatcher,
    disposing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Subscription client with transparent reconnect and replay
pub struct StreamClient<T: Transport = WsTransport> {
    inner: Arc<Inner<T>>,
    events_rx: Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl<T: Transport> std::fmt::Debug for StreamClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("state", &self.inner.transport.state())
            .field("dispatcher", &self.inner.dispatcher)
            .field("disposing", &self.is_disposing())
            .finish_non_exhaustive()
    }
}

impl StreamClient<WsTransport> {
    /// Create a WebSocket client for `config.url`.
    ///
    /// Must be called from within a tokio runtime. Nothing is connected until
    /// [`connect`](Self::connect) is called.
    pub fn new(config: ClientConfig, handler: impl MessageHandler) -> Result<Self> {
        config.validate()?;
        let (transport, transport_events) = WsTransport::new(&config);
        Ok(Self::with_transport(
            Arc::new(transport),
            transport_events,
            Arc::new(handler),
            &config,
        ))
    }
}

impl<T: Transport> StreamClient<T> {
    /// Build a client over any transport.
    ///
    /// `transport_events` must be the receiving end of the channel the
    /// transport raises its events on. Must be called from within a tokio
    /// runtime.
    pub fn with_transport(
        transport: Arc<T>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        handler: Arc<dyn MessageHandler>,
        config: &ClientConfig,
    ) -> Self {
        let registry = ChannelRegistry::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            transport: transport.clone(),
            registry: registry.clone(),
            dispatcher: Dispatcher::new(handler, config.dispatch_mode),
            disposing: AtomicBool::new(false),
            shutdown_tx,
        });

        let controller = ReconnectController::new(transport, registry);
        tokio::spawn(run_controller(
            inner.clone(),
            controller,
            transport_events,
            events_tx,
            shutdown_rx,
        ));

        Self {
            inner,
            events_rx: Mutex::new(events_rx),
        }
    }

    /// Current transport state
    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_disposing(&self) -> bool {
        self.inner.disposing.load(Ordering::Acquire)
    }

    /// Registry of channels that will be replayed after a reconnect
    pub fn registry(&self) -> &ChannelRegistry {
        &self.inner.registry
    }

    /// Number of messages handed to a background task so far
    pub fn scheduled_dispatches(&self) -> u64 {
        self.inner.dispatcher.scheduled_count()
    }

    /// Connect, resetting a finished socket first.
    ///
    /// Returns whether the connection ended up open; `Ok(false)` after
    /// disposal.
    pub async fn connect(&self) -> Result<bool> {
        if self.is_disposing() {
            return Ok(false);
        }
        if self.inner.transport.state().is_terminal() {
            self.inner.transport.reset_socket().await;
        }
        self.inner.transport.connect().await
    }

    /// Send `command` and, when `auto_reconnect` is set, remember it for
    /// replay under `channel_key`.
    ///
    /// Does not wait for any acknowledgement from the server.
    pub async fn subscribe(
        &self,
        channel_key: impl Into<String>,
        command: impl Into<String>,
        auto_reconnect: bool,
    ) -> Result<()> {
        if self.is_disposing() {
            return Ok(());
        }

        let channel_key = channel_key.into();
        let command = command.into();
        self.inner.transport.send(&command).await?;

        if auto_reconnect {
            self.inner.registry.insert(channel_key.clone(), command).await;
        }
        debug!(channel = %channel_key, auto_reconnect, "subscribed");
        Ok(())
    }

    /// Serialize `command` and subscribe with the resulting text
    pub async fn subscribe_command<C: ToText + ?Sized>(
        &self,
        channel_key: impl Into<String>,
        command: &C,
        auto_reconnect: bool,
    ) -> Result<()> {
        let text = command.to_text()?;
        self.subscribe(channel_key, text, auto_reconnect).await
    }

    /// Sign `command` for a private channel and subscribe with it.
    ///
    /// The signed text is what gets replayed; it is not re-signed.
    pub async fn subscribe_private(
        &self,
        channel_key: impl Into<String>,
        command: ChannelCommand,
        authenticator: &Authenticator,
        auto_reconnect: bool,
    ) -> Result<()> {
        let signed = authenticator.sign_command(command)?;
        self.subscribe_command(channel_key, &signed, auto_reconnect)
            .await
    }

    /// Send the unsubscribe `command` and stop tracking `channel_key`
    pub async fn unsubscribe(&self, channel_key: &str, command: impl Into<String>) -> Result<()> {
        if self.is_disposing() {
            return Ok(());
        }

        let command = command.into();
        self.inner.transport.send(&command).await?;
        self.inner.registry.remove(channel_key).await;
        debug!(channel = %channel_key, "unsubscribed");
        Ok(())
    }

    /// Serialize `command` and unsubscribe with the resulting text
    pub async fn unsubscribe_command<C: ToText + ?Sized>(
        &self,
        channel_key: &str,
        command: &C,
    ) -> Result<()> {
        let text = command.to_text()?;
        self.unsubscribe(channel_key, text).await
    }

    /// Forget every tracked channel without telling the server
    pub async fn clear_channels(&self) {
        self.inner.registry.clear().await;
    }

    /// Receive the next lifecycle event.
    ///
    /// Returns `None` once the client has been disposed.
    pub async fn recv(&self) -> Option<ClientEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await
    }

    /// Try to receive an event without waiting
    pub async fn try_recv(&self) -> Option<ClientEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.try_recv().ok()
    }

    /// Begin disposal.
    ///
    /// Never blocks and is safe to call from inside a handler; every later
    /// operation is a silent no-op.
    pub fn dispose(&self) {
        if self.inner.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_tx.send_replace(true);
        self.inner.transport.dispose();
        debug!("client disposing");
    }
}

impl<T: Transport> Drop for StreamClient<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Consumes transport events one at a time, so recoveries never overlap
async fn run_controller<T: Transport>(
    inner: Arc<Inner<T>>,
    controller: ReconnectController<T>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            event = transport_events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if inner.disposing.load(Ordering::Acquire) {
            break;
        }

        let notification = match event {
            TransportEvent::MessageArrived(text) => {
                inner.dispatcher.process_message(text).await;
                continue;
            }
            TransportEvent::ConnectionError(err) => ClientEvent::ConnectionError(err),
            TransportEvent::ConnectionClosed(reason) => match controller.recover().await {
                RecoveryOutcome::Replayed(replayed) => ClientEvent::Reconnected { replayed },
                RecoveryOutcome::NothingToReplay | RecoveryOutcome::Disposed => {
                    ClientEvent::ConnectionClosed(reason)
                }
                RecoveryOutcome::ReconnectFailed(state) => {
                    ClientEvent::ConnectionClosed(Some(Error::RecoveryFailed(state)))
                }
                RecoveryOutcome::ReplayInterrupted { remaining, .. } => {
                    ClientEvent::ConnectionClosed(Some(Error::ReplayInterrupted { remaining }))
                }
            },
        };

        if events_tx.send(notification).is_err() {
            warn!("client event receiver dropped");
            break;
        }
    }

    debug!("controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{HmacSigner, Signer};
    use crate::websocket::dispatcher::{MessageDisposition, NoopHandler};
    use crate::websocket::mock::MockTransport;
    use crate::websocket::DispatchMode;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Forwarding {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl MessageHandler for Forwarding {
        async fn handle_message(&self, text: String) -> MessageDisposition {
            let _ = self.tx.send(text);
            MessageDisposition::Handled
        }
    }

    struct Harness {
        client: StreamClient<MockTransport>,
        transport: Arc<MockTransport>,
        inject: mpsc::UnboundedSender<TransportEvent>,
    }

    async fn harness_with(handler: Arc<dyn MessageHandler>, mode: DispatchMode) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let (inject, transport_events) = mpsc::unbounded_channel();
        let config = ClientConfig::new("ws://mock").with_dispatch_mode(mode);
        let client =
            StreamClient::with_transport(transport.clone(), transport_events, handler, &config);
        assert!(client.connect().await.unwrap());
        Harness {
            client,
            transport,
            inject,
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(NoopHandler), DispatchMode::Background).await
    }

    async fn next_event(client: &StreamClient<MockTransport>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(1), client.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed")
    }

    /// Simulate the reader observing a clean close
    fn close(h: &Harness) {
        h.transport.set_state(ConnectionState::Closed);
        h.inject
            .send(TransportEvent::ConnectionClosed(None))
            .unwrap();
    }

    // ============ Subscribe / Unsubscribe Tests ============

    #[tokio::test]
    async fn test_subscribe_sends_and_tracks() {
        let h = harness().await;

        h.client
            .subscribe("ticker.BTC", "SUB ticker.BTC", true)
            .await
            .unwrap();

        assert_eq!(h.transport.sent(), vec!["SUB ticker.BTC".to_string()]);
        assert_eq!(
            h.client.registry().command("ticker.BTC").await.as_deref(),
            Some("SUB ticker.BTC")
        );
    }

    #[tokio::test]
    async fn test_subscribe_without_auto_reconnect_is_not_tracked() {
        let h = harness().await;

        h.client
            .subscribe("ticker.BTC", "SUB ticker.BTC", false)
            .await
            .unwrap();

        assert_eq!(h.transport.sent().len(), 1);
        assert!(h.client.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_subscribe_on_dead_connection_fails() {
        let h = harness().await;
        h.transport.set_state(ConnectionState::Closed);

        let err = h
            .client
            .subscribe("ticker.BTC", "SUB ticker.BTC", true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotOpen(ConnectionState::Closed)));
        assert!(h.client.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_unsubscribe_sends_and_forgets() {
        let h = harness().await;
        h.client
            .subscribe("ticker.BTC", "SUB ticker.BTC", true)
            .await
            .unwrap();

        h.client
            .unsubscribe("ticker.BTC", "UNSUB ticker.BTC")
            .await
            .unwrap();

        assert_eq!(
            h.transport.sent(),
            vec!["SUB ticker.BTC".to_string(), "UNSUB ticker.BTC".to_string()]
        );
        assert!(!h.client.registry().contains("ticker.BTC").await);
    }

    #[tokio::test]
    async fn test_clear_channels_sends_nothing() {
        let h = harness().await;
        h.client.subscribe("a", "SUB a", true).await.unwrap();
        h.client.subscribe("b", "SUB b", true).await.unwrap();
        h.transport.clear_sent();

        h.client.clear_channels().await;

        assert!(h.client.registry().is_empty().await);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_command_serializes() {
        let h = harness().await;
        let command = ChannelCommand::subscribe("trades.ETH").with_request_id("1");

        h.client
            .subscribe_command("trades.ETH", &command, true)
            .await
            .unwrap();

        let expected = command.to_text().unwrap();
        assert_eq!(h.transport.sent(), vec![expected.clone()]);
        assert_eq!(
            h.client.registry().command("trades.ETH").await,
            Some(expected)
        );
    }

    #[tokio::test]
    async fn test_subscribe_private_signs_payload() {
        let h = harness().await;
        let signer = HmacSigner::new("my-public-key", "my-secret").unwrap();
        let authenticator = Authenticator::new(signer.clone());

        h.client
            .subscribe_private(
                "account",
                ChannelCommand::subscribe("account"),
                &authenticator,
                true,
            )
            .await
            .unwrap();

        let sent = h.transport.sent();
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        let payload = value["payload"].as_str().unwrap();
        assert!(payload.starts_with("nonce="));
        assert_eq!(value["publicKey"], "my-public-key");
        assert_eq!(value["signature"], signer.sign(payload).unwrap());
    }

    // ============ Recovery Tests ============

    #[tokio::test]
    async fn test_close_with_tracked_channel_replays_silently() {
        let h = harness().await;
        h.client
            .subscribe("ticker.BTC", "SUB ticker.BTC", true)
            .await
            .unwrap();
        h.transport.clear_sent();

        close(&h);

        match next_event(&h.client).await {
            ClientEvent::Reconnected { replayed } => assert_eq!(replayed, 1),
            other => panic!("Expected Reconnected, got {:?}", other),
        }
        assert_eq!(h.transport.sent(), vec!["SUB ticker.BTC".to_string()]);
        assert_eq!(h.transport.connects(), 2);
        assert!(h.client.registry().contains("ticker.BTC").await);
        assert!(h.client.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_without_tracked_channels_propagates() {
        let h = harness().await;
        h.client
            .subscribe("ticker.BTC", "SUB ticker.BTC", false)
            .await
            .unwrap();

        close(&h);

        assert!(matches!(
            next_event(&h.client).await,
            ClientEvent::ConnectionClosed(None)
        ));
        assert_eq!(h.transport.connects(), 1);
        assert!(h.client.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_unsubscribe_then_close_replays_nothing() {
        let h = harness().await;
        h.client
            .subscribe("ticker.BTC", "SUB ticker.BTC", true)
            .await
            .unwrap();
        h.client
            .unsubscribe("ticker.BTC", "UNSUB ticker.BTC")
            .await
            .unwrap();
        h.transport.clear_sent();

        close(&h);

        assert!(matches!(
            next_event(&h.client).await,
            ClientEvent::ConnectionClosed(None)
        ));
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_failed_reconnect_propagates_once() {
        let h = harness().await;
        h.client
            .subscribe("ticker.BTC", "SUB ticker.BTC", true)
            .await
            .unwrap();
        h.transport.clear_sent();
        h.transport.push_connect_outcome(ConnectionState::Aborted);

        close(&h);

        match next_event(&h.client).await {
            ClientEvent::ConnectionClosed(Some(Error::RecoveryFailed(state))) => {
                assert_eq!(state, ConnectionState::Aborted)
            }
            other => panic!("Expected ConnectionClosed, got {:?}", other),
        }
        assert!(h.transport.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.client.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn test_interrupted_replay_surfaces_closure() {
        let h = harness().await;
        for key in ["a", "b", "c"] {
            h.client
                .subscribe(key, format!("SUB {key}"), true)
                .await
                .unwrap();
        }
        h.transport.clear_sent();
        h.transport.close_after_sends(2);

        close(&h);

        match next_event(&h.client).await {
            ClientEvent::ConnectionClosed(Some(Error::ReplayInterrupted { remaining })) => {
                assert_eq!(remaining, 1)
            }
            other => panic!("Expected ConnectionClosed, got {:?}", other),
        }
        assert_eq!(h.transport.sent().len(), 2);
        assert_eq!(h.client.registry().len().await, 3);
    }

    #[tokio::test]
    async fn test_connection_error_is_not_recovered() {
        let h = harness().await;
        h.client
            .subscribe("ticker.BTC", "SUB ticker.BTC", true)
            .await
            .unwrap();
        h.transport.set_state(ConnectionState::Aborted);

        h.inject
            .send(TransportEvent::ConnectionError(Error::WebSocket(
                "reset by peer".to_string(),
            )))
            .unwrap();

        assert!(matches!(
            next_event(&h.client).await,
            ClientEvent::ConnectionError(Error::WebSocket(_))
        ));
        assert_eq!(h.transport.connects(), 1);
    }

    // ============ Dispatch Tests ============

    #[tokio::test]
    async fn test_messages_reach_handler_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = harness_with(Arc::new(Forwarding { tx }), DispatchMode::Inline).await;

        for i in 0..5 {
            h.inject
                .send(TransportEvent::MessageArrived(format!("m{i}")))
                .unwrap();
        }

        for i in 0..5 {
            let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn test_default_handler_stops_scheduling() {
        let h = harness().await;

        h.inject
            .send(TransportEvent::MessageArrived("first".to_string()))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !h.client.inner.dispatcher.is_elided() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        for _ in 0..10 {
            h.inject
                .send(TransportEvent::MessageArrived("more".to_string()))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.client.scheduled_dispatches(), 1);
    }

    // ============ Disposal Tests ============

    #[tokio::test]
    async fn test_dispose_makes_operations_noops() {
        let h = harness().await;
        h.client.dispose();
        h.client.dispose();

        assert!(h.client.is_disposing());
        assert!(h.transport.is_disposing());
        assert!(!h.client.connect().await.unwrap());
        assert!(h.client.subscribe("a", "SUB a", true).await.is_ok());
        assert!(h.client.unsubscribe("a", "UNSUB a").await.is_ok());
        assert!(h.transport.sent().is_empty());
        assert!(h.client.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_dispose_stops_event_delivery() {
        let h = harness().await;
        h.client.subscribe("a", "SUB a", true).await.unwrap();
        h.client.dispose();

        let next = tokio::time::timeout(Duration::from_secs(1), h.client.recv())
            .await
            .unwrap();
        assert!(next.is_none());
        assert_eq!(h.transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_dispose_from_handler_does_not_block() {
        struct DisposeOnMessage {
            client: std::sync::Mutex<Option<Arc<StreamClient<MockTransport>>>>,
            done: mpsc::UnboundedSender<()>,
        }

        #[async_trait]
        impl MessageHandler for DisposeOnMessage {
            async fn handle_message(&self, _text: String) -> MessageDisposition {
                let client = self.client.lock().unwrap().clone();
                if let Some(client) = client {
                    client.dispose();
                }
                let _ = self.done.send(());
                MessageDisposition::Handled
            }
        }

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(DisposeOnMessage {
            client: std::sync::Mutex::new(None),
            done: done_tx,
        });
        let transport = Arc::new(MockTransport::new());
        let (inject, transport_events) = mpsc::unbounded_channel();
        let config = ClientConfig::new("ws://mock").with_dispatch_mode(DispatchMode::Inline);
        let client = Arc::new(StreamClient::with_transport(
            transport.clone(),
            transport_events,
            handler.clone(),
            &config,
        ));
        *handler.client.lock().unwrap() = Some(client.clone());

        inject
            .send(TransportEvent::MessageArrived("bye".to_string()))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(client.is_disposing());
        assert!(transport.is_disposing());
        handler.client.lock().unwrap().take();
    }

    #[test]
    fn test_client_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<StreamClient>();
        assert_sync::<StreamClient>();
        assert_send::<ClientEvent>();
    }
}
