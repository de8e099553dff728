//! Hand-off from the receive path to application message handling

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::debug;

/// How arrived messages reach the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Await the handler on the receive path (debugging)
    Inline,
    /// Run the handler on a spawned task
    #[default]
    Background,
}

/// What a handler did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// The message was consumed
    Handled,
    /// The handler does not consume messages at all
    Unhandled,
}

/// Application hook for pushed messages
///
/// The default implementation ignores every message and reports
/// [`MessageDisposition::Unhandled`]. A dispatcher that sees `Unhandled` stops
/// scheduling further messages for good, so only return it from a handler
/// that never wants to see another message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_message(&self, text: String) -> MessageDisposition {
        let _ = text;
        MessageDisposition::Unhandled
    }
}

/// Handler that keeps the default no-op behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl MessageHandler for NoopHandler {}

/// Delivers messages to a [`MessageHandler`] without blocking the reader
pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    mode: DispatchMode,
    elided: Arc<AtomicBool>,
    scheduled: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.mode)
            .field("elided", &self.is_elided())
            .field("scheduled", &self.scheduled_count())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn MessageHandler>, mode: DispatchMode) -> Self {
        Self {
            handler,
            mode,
            elided: Arc::new(AtomicBool::new(false)),
            scheduled: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Whether dispatch has been switched off because the handler is a no-op
    pub fn is_elided(&self) -> bool {
        self.elided.load(Ordering::Acquire)
    }

    /// Number of background tasks spawned so far
    pub fn scheduled_count(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Hand one message to the handler.
    ///
    /// Never fails and never propagates a handler panic to the caller.
    pub async fn process_message(&self, text: String) {
        if self.is_elided() {
            return;
        }

        match self.mode {
            DispatchMode::Inline => {
                let outcome = AssertUnwindSafe(self.handler.handle_message(text))
                    .catch_unwind()
                    .await;
                // handler panics are dropped without logging
                if let Ok(disposition) = outcome {
                    observe(&self.elided, disposition);
                }
            }
            DispatchMode::Background => {
                self.scheduled.fetch_add(1, Ordering::Relaxed);
                let handler = self.handler.clone();
                let elided = self.elided.clone();
                tokio::spawn(async move {
                    let disposition = handler.handle_message(text).await;
                    observe(&elided, disposition);
                });
            }
        }
    }
}

fn observe(elided: &AtomicBool, disposition: MessageDisposition) {
    if disposition == MessageDisposition::Unhandled && !elided.swap(true, Ordering::AcqRel) {
        debug!("message handler is a no-op, dispatch disabled");
    }
}
