//! Connection lifecycle state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!                     |                           |
//!                     +--------> Failed <---------+
//! ```
//!
//! Every state change in the crate goes through [`Lifecycle`]; nothing else
//! holds the sender half of the state channel.

use gateway_core::*;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::config::BackoffConfig;

/// Outcome of asking the lifecycle to start a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStart {
    /// The caller owns the attempt and must report its result.
    Started,
    /// Already connected; nothing to do.
    AlreadyConnected,
    /// Another connect or a reconnect is running.
    InProgress,
}

fn is_allowed(from: ConnectorState, to: ConnectorState) -> bool {
    use ConnectorState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Failed, Connecting)
            | (Connecting, Connected)
            | (Connecting, Failed)
            | (Connected, Reconnecting)
            | (Reconnecting, Connected)
            | (Reconnecting, Failed)
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
            | (Reconnecting, Disconnected)
            | (Failed, Disconnected)
    )
}

pub struct Lifecycle {
    connector: String,
    state: watch::Sender<ConnectorState>,
    last_error: Mutex<Option<ConnectionError>>,
    backoff: BackoffConfig,
    events: broadcast::Sender<GatewayEvent>,
}

impl Lifecycle {
    pub fn new(
        connector: &str,
        backoff: BackoffConfig,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        Self {
            connector: connector.to_string(),
            state,
            last_error: Mutex::new(None),
            backoff,
            events,
        }
    }

    /// Non-blocking snapshot of the current state.
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectorState::Connected
    }

    /// Watch state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectorState> {
        self.state.subscribe()
    }

    /// The terminal error, present while the connector is `Failed`.
    pub fn failure(&self) -> Option<ConnectionError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    pub fn max_attempts(&self) -> u32 {
        self.backoff.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }

    /// Gate for every operation that needs a live venue session.
    pub fn ensure_connected(&self) -> Result<(), GatewayError> {
        match self.state() {
            ConnectorState::Connected => Ok(()),
            ConnectorState::Failed => match self.failure() {
                Some(err) => Err(GatewayError::Connection(err)),
                None => Err(GatewayError::NotConnected {
                    state: ConnectorState::Failed,
                }),
            },
            state => Err(GatewayError::NotConnected { state }),
        }
    }

    /// Atomically claim a connect attempt.
    pub(crate) fn begin_connect(&self) -> ConnectStart {
        let mut outcome = ConnectStart::InProgress;
        let mut from = ConnectorState::Disconnected;
        self.state.send_if_modified(|state| {
            from = *state;
            match *state {
                ConnectorState::Disconnected | ConnectorState::Failed => {
                    *state = ConnectorState::Connecting;
                    outcome = ConnectStart::Started;
                    true
                }
                ConnectorState::Connected => {
                    outcome = ConnectStart::AlreadyConnected;
                    false
                }
                ConnectorState::Connecting | ConnectorState::Reconnecting => false,
            }
        });
        if outcome == ConnectStart::Started {
            self.clear_error();
            self.announce(from, ConnectorState::Connecting);
        }
        outcome
    }

    pub(crate) fn connected(&self) -> bool {
        self.transition(ConnectorState::Connected)
    }

    pub(crate) fn connect_failed(&self, error: ConnectionError) {
        warn!(connector = %self.connector, error = %error, "Connect failed");
        self.record_error(error);
        self.transition(ConnectorState::Failed);
    }

    /// An unsolicited drop was observed. Returns `true` if the caller should
    /// start the reconnect loop.
    pub(crate) fn transport_lost(&self, reason: &str) -> bool {
        let moved = self.transition(ConnectorState::Reconnecting);
        if moved {
            warn!(connector = %self.connector, reason, "Transport lost, reconnecting");
        }
        moved
    }

    pub(crate) fn reconnect_scheduled(&self, attempt: u32, delay: Duration) {
        info!(
            connector = %self.connector,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        let _ = self.events.send(GatewayEvent::ReconnectScheduled {
            connector: self.connector.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
    }

    /// Give up reconnecting. Returns `false` if the state moved on meanwhile
    /// (e.g. an explicit disconnect).
    pub(crate) fn reconnect_exhausted(&self, attempts: u32, last_error: String) -> bool {
        let error = ConnectionError::RetriesExhausted {
            attempts,
            last_error,
        };
        if self.state() != ConnectorState::Reconnecting {
            return false;
        }
        self.record_error(error);
        self.transition(ConnectorState::Failed)
    }

    pub(crate) fn disconnected(&self) -> bool {
        let moved = self.transition(ConnectorState::Disconnected);
        if moved {
            self.clear_error();
        }
        moved
    }

    fn transition(&self, to: ConnectorState) -> bool {
        let mut from = to;
        let moved = self.state.send_if_modified(|state| {
            from = *state;
            if is_allowed(*state, to) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            self.announce(from, to);
        }
        moved
    }

    fn announce(&self, from: ConnectorState, to: ConnectorState) {
        info!(connector = %self.connector, from = %from, to = %to, "Connector state changed");
        let _ = self.events.send(GatewayEvent::StateChanged {
            connector: self.connector.clone(),
            from,
            to,
        });
        if to == ConnectorState::Failed {
            if let Some(error) = self.failure() {
                let _ = self.events.send(GatewayEvent::ConnectionFailed {
                    connector: self.connector.clone(),
                    error: error.to_string(),
                });
            }
        }
    }

    fn record_error(&self, error: ConnectionError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
