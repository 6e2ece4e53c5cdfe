use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// Correlation IDs
// ---------------------------------------------------------------------------

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Client-generated identifier that ties an order request to the venue
/// events it eventually produces. Unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(u64);

impl CorrelationId {
    const PREFIX: &'static str = "gw-";

    /// Allocate the next id. Ids are never handed out twice.
    pub fn next() -> Self {
        Self(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(Self::PREFIX)
            .and_then(|n| n.parse::<u64>().ok())
            .map(CorrelationId)
            .ok_or_else(|| GatewayError::Validation(format!("not a correlation id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Connector state
// ---------------------------------------------------------------------------

/// Connection state of a single connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectorState::Disconnected => "disconnected",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Connected => "connected",
            ConnectorState::Reconnecting => "reconnecting",
            ConnectorState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// A top-of-book quote pushed by a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

/// The type of order, carrying its price where one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "price")]
pub enum OrderType {
    Market,
    Limit(Decimal),
    Stop(Decimal),
}

impl OrderType {
    pub fn price(&self) -> Option<Decimal> {
        match self {
            OrderType::Market => None,
            OrderType::Limit(p) | OrderType::Stop(p) => Some(*p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    #[default]
    GoodTillCancelled,
    ImmediateOrCancel,
    FillOrKill,
    Day,
}

/// What an upstream caller asks the gateway to submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    #[serde(default)]
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    /// Create a new market order request.
    pub fn market(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::ImmediateOrCancel,
        }
    }

    /// Create a new limit order request.
    pub fn limit(symbol: &str, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Limit(price),
            time_in_force: TimeInForce::GoodTillCancelled,
        }
    }

    /// Reject malformed parameters before anything is sent to a venue.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.symbol.trim().is_empty() {
            return Err(GatewayError::Validation("symbol must not be empty".into()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(GatewayError::Validation(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if let Some(price) = self.order_type.price() {
            if price <= Decimal::ZERO {
                return Err(GatewayError::Validation(format!(
                    "price must be positive, got {price}"
                )));
            }
        }
        Ok(())
    }
}

/// Changes requested for a working order. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderAmendment {
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
}

impl OrderAmendment {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.quantity.is_none() && self.price.is_none() {
            return Err(GatewayError::Validation("amendment changes nothing".into()));
        }
        if matches!(self.quantity, Some(q) if q <= Decimal::ZERO) {
            return Err(GatewayError::Validation("amended quantity must be positive".into()));
        }
        if matches!(self.price, Some(p) if p <= Decimal::ZERO) {
            return Err(GatewayError::Validation("amended price must be positive".into()));
        }
        Ok(())
    }
}

/// The lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Position in the lifecycle. Transitions may never lower the rank.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Submitted => 0,
            OrderStatus::Acknowledged => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled
            | OrderStatus::Cancelled
            | OrderStatus::Rejected
            | OrderStatus::Expired => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }
}

/// Why an order was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause", content = "detail")]
pub enum RejectCause {
    /// The venue refused the order.
    Venue(String),
    /// No acknowledgement arrived in time.
    Timeout,
}

/// An order as tracked by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub correlation_id: CorrelationId,
    /// Venue-assigned ID, known once acknowledged.
    pub venue_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub reject_cause: Option<RejectCause>,
}

impl Order {
    /// A freshly submitted order, before any venue round trip.
    pub fn submitted(correlation_id: CorrelationId, request: &OrderRequest) -> Self {
        Self {
            correlation_id,
            venue_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            order_type: request.order_type,
            time_in_force: request.time_in_force,
            status: OrderStatus::Submitted,
            submitted_at: Utc::now(),
            acknowledged_at: None,
            terminal_at: None,
            reject_cause: None,
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// An order as reported by a venue pull query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub venue_id: String,
    /// Client id echoed back by the venue, if the venue keeps one.
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub order_type: OrderType,
    pub status: OrderStatus,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Net position in one symbol. Positive quantity is long, negative short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub net_quantity: Decimal,
    pub avg_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.net_quantity.is_zero()
    }

    /// The side of the order that would flatten this position.
    pub fn closing_side(&self) -> Side {
        if self.net_quantity > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// P&L of the position marked at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.avg_price) * self.net_quantity
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Snapshot of the account held at a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub currency: String,
    pub unrealized_pnl: Decimal,
    pub margin_used: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn margin_available(&self) -> Decimal {
        self.equity - self.margin_used
    }
}

// ---------------------------------------------------------------------------
// Market data subscription
// ---------------------------------------------------------------------------

/// Handle returned to a caller that registered market data interest.
///
/// The liveness flag is shared with the hub; it flips to `false` once the
/// subscription is removed or the listener's dispatcher stops.
#[derive(Debug, Clone)]
pub struct MarketDataSubscription {
    pub id: u64,
    pub symbols: Vec<String>,
    /// Name of the listener the quotes are delivered to.
    pub listener: String,
    live: Arc<AtomicBool>,
}

impl MarketDataSubscription {
    pub fn new(id: u64, symbols: Vec<String>, listener: String, live: Arc<AtomicBool>) -> Self {
        Self {
            id,
            symbols,
            listener,
            live,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_correlation_ids_are_unique_and_parse_back() {
        let a = CorrelationId::next();
        let b = CorrelationId::next();
        assert_ne!(a, b);
        assert!(b.value() > a.value());

        let parsed: CorrelationId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
        assert!("12345".parse::<CorrelationId>().is_err());
    }

    #[test]
    fn test_order_request_validation() {
        assert!(OrderRequest::market("EURUSD", Side::Buy, dec!(100)).validate().is_ok());
        assert!(OrderRequest::market("", Side::Buy, dec!(100)).validate().is_err());
        assert!(OrderRequest::market("EURUSD", Side::Buy, dec!(0)).validate().is_err());
        assert!(OrderRequest::limit("EURUSD", Side::Sell, dec!(1), dec!(-1.1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_status_rank_is_monotonic_through_the_lifecycle() {
        assert!(OrderStatus::Submitted.rank() < OrderStatus::Acknowledged.rank());
        assert!(OrderStatus::Acknowledged.rank() < OrderStatus::PartiallyFilled.rank());
        assert!(OrderStatus::PartiallyFilled.rank() < OrderStatus::Filled.rank());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_position_pnl_short() {
        let pos = Position {
            symbol: "EURUSD".into(),
            net_quantity: dec!(-1000),
            avg_price: dec!(1.1000),
            unrealized_pnl: Decimal::ZERO,
            updated_at: Utc::now(),
        };
        assert_eq!(pos.pnl_at(dec!(1.0900)), dec!(10.0000));
        assert_eq!(pos.closing_side(), Side::Buy);
    }
}
