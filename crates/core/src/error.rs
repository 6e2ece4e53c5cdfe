use std::time::Duration;

use crate::models::{ConnectorState, CorrelationId};

/// Why a connection could not be established or kept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("Reconnect gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Errors surfaced to upstream callers and listeners.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Not connected (state: {state})")]
    NotConnected { state: ConnectorState },
    #[error("Order {correlation_id} rejected: {reason}")]
    OrderRejected {
        correlation_id: CorrelationId,
        reason: String,
    },
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Duplicate venue subscription for {symbol}")]
    DuplicateSubscription { symbol: String },
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Venue error: {0}")]
    Venue(String),
}

/// Errors reported by a venue adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VenueError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Rejected by venue: {0}")]
    Rejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl VenueError {
    /// Interpret a failure seen while opening the transport.
    pub fn into_connection_error(self, timeout: Duration) -> ConnectionError {
        match self {
            VenueError::Auth(msg) => ConnectionError::Auth(msg),
            VenueError::Timeout => ConnectionError::Timeout(timeout),
            other => ConnectionError::Network(other.to_string()),
        }
    }

    /// Whether the failure means the transport itself is gone.
    pub fn is_transport(&self) -> bool {
        matches!(self, VenueError::Transport(_) | VenueError::Timeout)
    }
}

impl From<VenueError> for GatewayError {
    fn from(e: VenueError) -> Self {
        match e {
            VenueError::NotFound(what) => GatewayError::NotFound(what),
            other => GatewayError::Venue(other.to_string()),
        }
    }
}

/// Returned by a listener that failed to handle an event.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Listener failed: {0}")]
pub struct ListenerError(pub String);
