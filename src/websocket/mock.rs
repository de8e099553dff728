//! In-memory transport for exercising the client layer without sockets

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::transport::{ConnectionState, Transport};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    state: Mutex<ConnectionState>,
    sent: Mutex<Vec<String>>,
    /// States that successive connects end in; `Open` once exhausted
    connect_outcomes: Mutex<VecDeque<ConnectionState>>,
    /// Drop to `Closed` after this many more successful sends
    close_after_sends: Mutex<Option<usize>>,
    /// When set, connects stall until the gate is notified
    connect_gate: Mutex<Option<Arc<Notify>>>,
    connects: AtomicUsize,
    resets: AtomicUsize,
    disposing: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn push_connect_outcome(&self, state: ConnectionState) {
        self.connect_outcomes.lock().unwrap().push_back(state);
    }

    pub(crate) fn close_after_sends(&self, sends: usize) {
        *self.close_after_sends.lock().unwrap() = Some(sends);
    }

    /// Make every later connect wait for a notification on the returned gate
    pub(crate) fn gate_connects(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn connect(&self) -> Result<bool> {
        if self.is_disposing() {
            return Ok(false);
        }
        if self.state() == ConnectionState::Open {
            return Ok(true);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
        let gate = self.connect_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let outcome = self
            .connect_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectionState::Open);
        self.set_state(outcome);
        Ok(outcome == ConnectionState::Open)
    }

    async fn send(&self, text: &str) -> Result<()> {
        if self.is_disposing() {
            return Ok(());
        }
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(Error::NotOpen(state));
        }
        self.sent.lock().unwrap().push(text.to_string());

        let now_closed = {
            let mut close_after = self.close_after_sends.lock().unwrap();
            match *close_after {
                Some(n) if n <= 1 => {
                    *close_after = None;
                    true
                }
                Some(n) => {
                    *close_after = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if now_closed {
            self.set_state(ConnectionState::Closed);
        }
        Ok(())
    }

    async fn reset_socket(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::None);
    }

    fn dispose(&self) {
        self.disposing.store(true, Ordering::SeqCst);
    }

    fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }
}
