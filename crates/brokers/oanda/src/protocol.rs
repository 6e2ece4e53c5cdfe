//! OANDA v20 wire types and their mapping onto gateway types.

use chrono::{DateTime, Utc};
use gateway_core::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// REST payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSummaryResponse {
    pub account: AccountSummary,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub id: String,
    pub currency: String,
    pub balance: Decimal,
    #[serde(rename = "NAV")]
    pub nav: Decimal,
    #[serde(rename = "unrealizedPL")]
    pub unrealized_pl: Decimal,
    pub margin_used: Decimal,
}

impl From<AccountSummary> for Account {
    fn from(summary: AccountSummary) -> Self {
        Account {
            id: summary.id,
            balance: summary.balance,
            equity: summary.nav,
            currency: summary.currency,
            unrealized_pnl: summary.unrealized_pl,
            margin_used: summary.margin_used,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenPositionsResponse {
    pub positions: Vec<WirePosition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePosition {
    pub instrument: String,
    pub long: PositionSide,
    pub short: PositionSide,
    #[serde(rename = "unrealizedPL")]
    pub unrealized_pl: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSide {
    pub units: Decimal,
    pub average_price: Option<Decimal>,
}

impl From<WirePosition> for Position {
    fn from(wire: WirePosition) -> Self {
        let net = wire.long.units + wire.short.units;
        let avg = if net > Decimal::ZERO {
            wire.long.average_price
        } else {
            wire.short.average_price
        };
        Position {
            symbol: wire.instrument,
            net_quantity: net,
            avg_price: avg.unwrap_or_default(),
            unrealized_pnl: wire.unrealized_pl,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrdersResponse {
    pub orders: Vec<WireOrder>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order: WireOrder,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientExtensions {
    pub id: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrder {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub instrument: Option<String>,
    pub units: Option<Decimal>,
    pub price: Option<Decimal>,
    pub state: String,
    pub time_in_force: Option<String>,
    pub client_extensions: Option<ClientExtensions>,
}

impl WireOrder {
    /// Entry orders map to a venue order; dependent orders (take profit,
    /// stop loss, trailing stop) have no counterpart and map to `None`.
    pub fn into_venue_order(self) -> Option<VenueOrder> {
        let instrument = self.instrument?;
        let units = self.units?;
        let order_type = match (self.kind.as_str(), self.price) {
            ("MARKET", _) => OrderType::Market,
            ("LIMIT", Some(price)) => OrderType::Limit(price),
            ("STOP" | "MARKET_IF_TOUCHED", Some(price)) => OrderType::Stop(price),
            _ => return None,
        };
        let status = match self.state.as_str() {
            "PENDING" => OrderStatus::Acknowledged,
            "FILLED" | "TRIGGERED" => OrderStatus::Filled,
            "CANCELLED" => OrderStatus::Cancelled,
            _ => return None,
        };
        let quantity = units.abs();
        Some(VenueOrder {
            venue_id: self.id,
            client_id: self.client_extensions.and_then(|c| c.id),
            symbol: instrument,
            side: side_of(units),
            quantity,
            filled_quantity: if status == OrderStatus::Filled {
                quantity
            } else {
                Decimal::ZERO
            },
            order_type,
            status,
        })
    }
}

/// Body of `POST /v3/accounts/{id}/orders`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderEnvelope {
    pub order: OrderSpec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSpec {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub instrument: String,
    /// Signed units as a string; negative sells.
    pub units: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub time_in_force: &'static str,
    pub client_extensions: ClientExtensions,
}

impl OrderSpec {
    pub fn new(correlation_id: CorrelationId, request: &OrderRequest) -> Self {
        let units = request.side.sign() * request.quantity;
        let (kind, tif) = match request.order_type {
            OrderType::Market => (
                "MARKET",
                match request.time_in_force {
                    TimeInForce::ImmediateOrCancel => "IOC",
                    _ => "FOK",
                },
            ),
            OrderType::Limit(_) => ("LIMIT", entry_time_in_force(request.time_in_force)),
            OrderType::Stop(_) => ("STOP", entry_time_in_force(request.time_in_force)),
        };
        Self {
            kind,
            instrument: request.symbol.clone(),
            units: units.normalize().to_string(),
            price: request.order_type.price().map(|p| p.normalize().to_string()),
            time_in_force: tif,
            client_extensions: ClientExtensions {
                id: Some(correlation_id.to_string()),
                tag: Some("gateway".to_string()),
            },
        }
    }
}

fn entry_time_in_force(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GoodTillCancelled => "GTC",
        TimeInForce::ImmediateOrCancel => "IOC",
        TimeInForce::FillOrKill => "FOK",
        TimeInForce::Day => "GFD",
    }
}

/// Error body OANDA returns on 4xx responses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_message: Option<String>,
    pub reject_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Streaming payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PriceBucket {
    pub price: Decimal,
}

/// One line of the pricing stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PricingLine {
    #[serde(rename = "PRICE")]
    Price {
        instrument: String,
        time: DateTime<Utc>,
        bids: Vec<PriceBucket>,
        asks: Vec<PriceBucket>,
    },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { time: DateTime<Utc> },
}

impl PricingLine {
    pub fn into_quote(self) -> Option<Quote> {
        match self {
            PricingLine::Price {
                instrument,
                time,
                bids,
                asks,
            } => Some(Quote {
                symbol: instrument,
                bid: bids.first()?.price,
                ask: asks.first()?.price,
                last: None,
                timestamp: time,
            }),
            PricingLine::Heartbeat { .. } => None,
        }
    }
}

/// One line of the transaction stream. Only the fields the gateway reads
/// are declared; the rest of each transaction is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLine {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Option<String>,
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "orderID")]
    pub order_id: Option<String>,
    #[serde(rename = "clientOrderID")]
    pub client_order_id: Option<String>,
    #[serde(rename = "replacesOrderID")]
    pub replaces_order_id: Option<String>,
    pub client_extensions: Option<ClientExtensions>,
    pub units: Option<Decimal>,
    pub price: Option<Decimal>,
    pub reason: Option<String>,
    pub reject_reason: Option<String>,
}

/// What a transaction line means to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    Event(VenueEvent),
    /// An order replaced another one (how OANDA amends).
    Replaced { old_id: String, new_id: String, event: VenueEvent },
    /// The order left the book. OANDA fills an order in one transaction.
    Closed { order_id: String, event: VenueEvent },
    Heartbeat,
    Ignored,
}

impl TransactionLine {
    pub fn into_transaction(self) -> Transaction {
        if self.kind == "HEARTBEAT" {
            return Transaction::Heartbeat;
        }
        let Some(seq) = self.id.as_deref().and_then(|id| id.parse::<u64>().ok()) else {
            return Transaction::Ignored;
        };
        let client_id = self
            .client_order_id
            .clone()
            .or_else(|| self.client_extensions.as_ref().and_then(|c| c.id.clone()));
        let reason = self
            .reject_reason
            .clone()
            .or_else(|| self.reason.clone())
            .unwrap_or_else(|| self.kind.clone());

        match self.kind.as_str() {
            "MARKET_ORDER" | "LIMIT_ORDER" | "STOP_ORDER" | "MARKET_IF_TOUCHED_ORDER" => {
                let venue_id = self.id.clone().unwrap_or_default();
                if let Some(old_id) = self.replaces_order_id {
                    return Transaction::Replaced {
                        event: VenueEvent::Amended {
                            venue_id: old_id.clone(),
                            quantity: self.units.map(|u| u.abs()),
                            price: self.price,
                            seq,
                        },
                        old_id,
                        new_id: venue_id,
                    };
                }
                match client_id.and_then(|c| c.parse::<CorrelationId>().ok()) {
                    Some(correlation_id) => Transaction::Event(VenueEvent::Accepted {
                        correlation_id,
                        venue_id,
                        seq,
                    }),
                    None => Transaction::Ignored,
                }
            }
            kind if kind.ends_with("_ORDER_REJECT") => {
                match client_id.and_then(|c| c.parse::<CorrelationId>().ok()) {
                    Some(cid) => Transaction::Event(VenueEvent::Rejected {
                        order: OrderRef::Correlation(cid),
                        reason,
                        seq,
                    }),
                    None => Transaction::Ignored,
                }
            }
            "ORDER_FILL" => {
                let (Some(order_id), Some(units), Some(price)) = (self.order_id, self.units, self.price)
                else {
                    return Transaction::Ignored;
                };
                Transaction::Closed {
                    event: VenueEvent::Filled {
                        order: OrderRef::from_ids(&order_id, client_id.as_deref()),
                        quantity: units.abs(),
                        price,
                        seq,
                        timestamp: self.time.unwrap_or_else(Utc::now),
                    },
                    order_id,
                }
            }
            "ORDER_CANCEL" => {
                let Some(order_id) = self.order_id else {
                    return Transaction::Ignored;
                };
                let order = OrderRef::from_ids(&order_id, client_id.as_deref());
                let event = match self.reason.as_deref() {
                    // The replacing order's transaction carries the amendment.
                    Some("CLIENT_REQUEST_REPLACED") => return Transaction::Ignored,
                    Some("TIME_IN_FORCE_EXPIRED") => VenueEvent::Expired { order, seq },
                    _ => VenueEvent::Cancelled { order, seq },
                };
                Transaction::Closed { order_id, event }
            }
            "ORDER_CANCEL_REJECT" => match self.order_id {
                Some(venue_id) => Transaction::Event(VenueEvent::ActionRejected {
                    venue_id,
                    reason,
                    seq,
                }),
                None => Transaction::Ignored,
            },
            _ => Transaction::Ignored,
        }
    }
}

fn side_of(units: Decimal) -> Side {
    if units < Decimal::ZERO {
        Side::Sell
    } else {
        Side::Buy
    }
}

/// Split a chunked byte stream into complete newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }
}
