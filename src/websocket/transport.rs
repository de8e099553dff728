//! Socket transport
//!
//! A transport owns exactly one physical connection at a time. It opens the
//! connection, writes text frames, drives a background reader that turns
//! inbound frames into [`TransportEvent`]s, and closes gracefully on request.
//! It never retries on its own; recovery belongs to the
//! [`ReconnectController`](super::ReconnectController).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Upper bound on the closing handshake when a socket is torn down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle stage of the underlying socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Fresh socket, never connected
    #[default]
    None,
    /// Opening handshake in progress
    Connecting,
    /// Connected and ready
    Open,
    /// Closing handshake in progress
    Closing,
    /// Closed cleanly
    Closed,
    /// Torn down by an error
    Aborted,
}

impl ConnectionState {
    /// Whether the socket is finished and must be reset before reconnecting
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Aborted)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::None => write!(f, "None"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Event raised by a transport
///
/// A reader exit raises exactly one of `ConnectionClosed` or
/// `ConnectionError`, never both.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete text message arrived
    MessageArrived(String),
    /// The connection ended without an error
    ConnectionClosed(Option<Error>),
    /// The reader stopped because of an error
    ConnectionError(Error),
}

/// Connection operations the client layer relies on
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Open the connection and start the reader.
    ///
    /// Returns `Ok(true)` immediately when already open and `Ok(false)` when
    /// the transport is being disposed.
    async fn connect(&self) -> Result<bool>;

    /// Send a text frame, waiting out an in-flight handshake first
    async fn send(&self, text: &str) -> Result<()>;

    /// Drop the current socket and start over from [`ConnectionState::None`]
    async fn reset_socket(&self);

    /// Begin disposal; later connects and sends become no-ops
    fn dispose(&self);

    /// Whether disposal has begun
    fn is_disposing(&self) -> bool;

    /// Reset a finished socket and connect again, returning the resulting state
    async fn reconnect(&self) -> Result<ConnectionState> {
        let state = self.state();
        if state == ConnectionState::Open {
            return Err(Error::WebSocket(
                "Reconnect requested while the connection is open".to_string(),
            ));
        }
        if state.is_terminal() {
            self.reset_socket().await;
        }
        self.connect().await?;
        Ok(self.state())
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Write half of the live connection, tagged with the socket generation it
/// belongs to
struct ActiveSink {
    generation: u64,
    sink: WsSink,
}

/// State shared between the transport and its background tasks
struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    sink: Mutex<Option<ActiveSink>>,
    generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    verbose: bool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                debug!(from = %current, to = %state, "connection state changed");
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn log_frame(&self, direction: &str, text: &str) {
        if self.verbose {
            debug!(direction, frame = %text, "text frame");
        } else {
            trace!(direction, frame = %text, "text frame");
        }
    }

    /// Close the write half if it still belongs to `generation`
    async fn close_sink(&self, generation: u64) {
        let active = {
            let mut guard = self.sink.lock().await;
            match guard.as_ref() {
                Some(active) if active.generation == generation => guard.take(),
                _ => None,
            }
        };
        if let Some(mut active) = active {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, active.sink.close()).await;
        }
    }
}

/// WebSocket transport backed by tokio-tungstenite
pub struct WsTransport {
    url: String,
    keep_alive: Option<Duration>,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    /// Reader and heartbeat tasks of the current socket
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Serialises connects; sends never take it
    connect_lock: Mutex<()>,
    disposing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    /// Create a transport for `config.url`.
    ///
    /// The returned receiver yields every event the transport raises, in
    /// wire order.
    pub fn new(config: &ClientConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::None);
        let (shutdown_tx, _) = watch::channel(false);

        let transport = Self {
            url: config.url.clone(),
            keep_alive: config.keep_alive,
            connect_timeout: config.connect_timeout,
            shared: Arc::new(Shared {
                state_tx,
                sink: Mutex::new(None),
                generation: AtomicU64::new(0),
                events_tx,
                verbose: config.verbose,
            }),
            tasks: std::sync::Mutex::new(Vec::new()),
            connect_lock: Mutex::new(()),
            disposing: AtomicBool::new(false),
            shutdown_tx,
        };

        (transport, events_rx)
    }

    /// Endpoint this transport connects to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Subscribe to state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the state is anything but `Connecting`
    async fn wait_while_connecting(&self) -> ConnectionState {
        let mut rx = self.shared.state_tx.subscribe();
        let settled = match rx.wait_for(|s| *s != ConnectionState::Connecting).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        };
        settled
    }

    fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|h| !h.is_finished());
            tasks.extend(handles);
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }

    fn spawn_reader(&self, stream: WsStream, generation: u64) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(read_loop(stream, shared, generation, shutdown_rx))
    }

    fn spawn_heartbeat(&self, period: Duration, generation: u64) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if !shared.is_current(generation)
                            || *shared.state_tx.borrow() != ConnectionState::Open
                        {
                            break;
                        }
                        let mut guard = shared.sink.lock().await;
                        if let Some(active) = guard.as_mut().filter(|a| a.generation == generation) {
                            if let Err(e) = active.sink.send(Message::Ping(b"ping".to_vec())).await {
                                // the reader reports the failure
                                debug!(error = %e, "heartbeat ping failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    async fn connect(&self) -> Result<bool> {
        if self.is_disposing() {
            return Ok(false);
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_disposing() {
            return Ok(false);
        }

        match self.state() {
            ConnectionState::Open => return Ok(true),
            ConnectionState::None => {}
            other => {
                return Err(Error::WebSocket(format!(
                    "Socket is {other}; reset it before connecting"
                )))
            }
        }

        self.shared.set_state(ConnectionState::Connecting);
        info!(url = %self.url, "connecting");

        let ws_stream =
            match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await
            {
                Ok(Ok((ws_stream, _response))) => ws_stream,
                Ok(Err(e)) => {
                    self.shared.set_state(ConnectionState::Aborted);
                    warn!(url = %self.url, error = %e, "connect failed");
                    return Err(e.into());
                }
                Err(_) => {
                    self.shared.set_state(ConnectionState::Aborted);
                    warn!(url = %self.url, timeout = ?self.connect_timeout, "connect timed out");
                    return Err(Error::WebSocket(format!(
                        "Handshake timed out after {:?}",
                        self.connect_timeout
                    )));
                }
            };

        let (sink, stream) = ws_stream.split();
        let generation = self.shared.generation.load(Ordering::Acquire);

        if self.is_disposing() {
            let mut sink = sink;
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
            self.shared.set_state(ConnectionState::Closed);
            return Ok(false);
        }

        *self.shared.sink.lock().await = Some(ActiveSink { generation, sink });
        self.shared.set_state(ConnectionState::Open);

        let mut handles = vec![self.spawn_reader(stream, generation)];
        if let Some(period) = self.keep_alive {
            handles.push(self.spawn_heartbeat(period, generation));
        }
        self.track(handles);

        info!(url = %self.url, "connected");

        Ok(self.wait_while_connecting().await == ConnectionState::Open)
    }

    async fn send(&self, text: &str) -> Result<()> {
        if self.is_disposing() {
            return Ok(());
        }

        let state = self.wait_while_connecting().await;
        if state != ConnectionState::Open {
            return Err(Error::NotOpen(state));
        }

        let mut guard = self.shared.sink.lock().await;
        match guard.as_mut() {
            Some(active) => {
                self.shared.log_frame("out", text);
                active.sink.send(Message::Text(text.to_string())).await?;
                Ok(())
            }
            None => Err(Error::NotOpen(self.state())),
        }
    }

    async fn reset_socket(&self) {
        let _guard = self.connect_lock.lock().await;

        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.abort_tasks();

        let previous = self.shared.sink.lock().await.take();
        if let Some(mut active) = previous {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, active.sink.close()).await;
        }

        self.shared.set_state(ConnectionState::None);
        debug!(url = %self.url, "socket reset");
    }

    fn dispose(&self) {
        if self.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        debug!(url = %self.url, "transport disposing");
    }

    fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }
}

enum ReadOutcome {
    Closed,
    Failed(Error),
}

/// Background reader for one socket generation
async fn read_loop(
    mut stream: WsStream,
    shared: Arc<Shared>,
    generation: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let outcome = if *shutdown_rx.borrow_and_update() {
        graceful_close(&shared, generation).await;
        ReadOutcome::Closed
    } else {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        graceful_close(&shared, generation).await;
                        break ReadOutcome::Closed;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        shared.log_frame("in", &text);
                        if shared.events_tx.send(TransportEvent::MessageArrived(text)).is_err() {
                            // nobody is listening any more
                            graceful_close(&shared, generation).await;
                            break ReadOutcome::Closed;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            shared.log_frame("in", &text);
                            let _ = shared.events_tx.send(TransportEvent::MessageArrived(text));
                        }
                        Err(e) => debug!(len = e.as_bytes().len(), "dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "close frame received");
                        graceful_close(&shared, generation).await;
                        break ReadOutcome::Closed;
                    }
                    // ping/pong replies are handled by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break ReadOutcome::Failed(e.into()),
                    None => break ReadOutcome::Closed,
                },
            }
        }
    };

    if !shared.is_current(generation) {
        return;
    }

    match outcome {
        ReadOutcome::Closed => {
            shared.close_sink(generation).await;
            shared.set_state(ConnectionState::Closed);
            info!("connection closed");
            let _ = shared.events_tx.send(TransportEvent::ConnectionClosed(None));
        }
        ReadOutcome::Failed(err) => {
            shared.set_state(ConnectionState::Aborted);
            shared.close_sink(generation).await;
            warn!(error = %err, "connection aborted");
            let _ = shared.events_tx.send(TransportEvent::ConnectionError(err));
        }
    }
}

async fn graceful_close(shared: &Shared, generation: u64) {
    if shared.is_current(generation) {
        shared.set_state(ConnectionState::Closing);
    }
    shared.close_sink(generation).await;
}
