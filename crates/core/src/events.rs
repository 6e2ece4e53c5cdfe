use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::*;

// ---------------------------------------------------------------------------
// Venue events (adapter -> core)
// ---------------------------------------------------------------------------

/// Normalized push traffic from a venue.
///
/// Order events carry `seq`, a per-venue sequence number. The core drops
/// any (order, seq) pair it has already applied, so adapters may forward
/// the same venue message more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VenueEvent {
    /// Venue confirmed receipt and assigned an id.
    Accepted {
        correlation_id: CorrelationId,
        venue_id: String,
        seq: u64,
    },
    /// A working order's quantity or price was changed.
    Amended {
        venue_id: String,
        quantity: Option<Decimal>,
        price: Option<Decimal>,
        seq: u64,
    },
    Filled {
        order: OrderRef,
        quantity: Decimal,
        price: Decimal,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        order: OrderRef,
        seq: u64,
    },
    Rejected {
        order: OrderRef,
        reason: String,
        seq: u64,
    },
    Expired {
        order: OrderRef,
        seq: u64,
    },
    /// A cancel or amend request was refused; the order itself is unchanged.
    ActionRejected {
        venue_id: String,
        reason: String,
        seq: u64,
    },
    Quote(Quote),
    Account(Account),
    Position(Position),
    /// The transport dropped without the core asking it to.
    TransportLost { reason: String },
}

/// How a venue event identifies the order it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRef {
    Correlation(CorrelationId),
    Venue(String),
}

impl OrderRef {
    /// Build a reference from a venue id and the client id the venue echoed
    /// back, preferring the client id when it parses.
    pub fn from_ids(venue_id: &str, client_id: Option<&str>) -> Self {
        client_id
            .and_then(|c| c.parse::<CorrelationId>().ok())
            .map(OrderRef::Correlation)
            .unwrap_or_else(|| OrderRef::Venue(venue_id.to_string()))
    }
}

/// Channel end handed to an adapter when its transport opens.
pub type VenueSink = mpsc::UnboundedSender<VenueEvent>;

// ---------------------------------------------------------------------------
// Listener-facing events
// ---------------------------------------------------------------------------

/// A state transition of one order, delivered to order update listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub connector: String,
    pub previous: OrderStatus,
    pub order: Order,
    /// Set when the transition was caused by an execution.
    pub fill: Option<FillDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillDetail {
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Market data events delivered to market data listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketDataEvent {
    Quote { connector: String, quote: Quote },
}

impl MarketDataEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketDataEvent::Quote { quote, .. } => &quote.symbol,
        }
    }
}

// ---------------------------------------------------------------------------
// Observability events
// ---------------------------------------------------------------------------

/// Structured events a connector publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GatewayEvent {
    StateChanged {
        connector: String,
        from: ConnectorState,
        to: ConnectorState,
    },
    ReconnectScheduled {
        connector: String,
        attempt: u32,
        delay_ms: u64,
    },
    ConnectionFailed {
        connector: String,
        error: String,
    },
    OrderTimedOut {
        connector: String,
        correlation_id: CorrelationId,
    },
    /// A venue event was not applied (unknown order, duplicate, backward move).
    VenueEventDropped {
        connector: String,
        reason: String,
    },
    StaleUpdateDiscarded {
        connector: String,
        symbol: String,
    },
    ListenerFailed {
        connector: String,
        listener: String,
        error: String,
    },
}
