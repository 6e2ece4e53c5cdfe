use chrono::{DateTime, Utc};
use gateway_core::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame the bridge is allowed to send.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Messages sent from the Rust client TO MetaTrader.
///
/// Every request carries a `request_id` the EA echoes back on its reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// First message on a new connection.
    #[serde(rename = "hello")]
    Hello {
        client: String,
        api_key: Option<String>,
    },
    /// Submit a new order.
    #[serde(rename = "order_submit")]
    OrderSubmit {
        request_id: u64,
        client_order_id: String,
        instrument: String,
        side: String,
        order_type: String,
        quantity: Decimal,
        price: Option<Decimal>,
        time_in_force: String,
    },
    /// Cancel an existing order.
    #[serde(rename = "order_cancel")]
    OrderCancel {
        request_id: u64,
        broker_order_id: String,
    },
    /// Modify an existing order.
    #[serde(rename = "order_modify")]
    OrderModify {
        request_id: u64,
        broker_order_id: String,
        quantity: Option<Decimal>,
        price: Option<Decimal>,
    },
    /// Request current account state.
    #[serde(rename = "account_request")]
    AccountRequest { request_id: u64 },
    /// Request current positions.
    #[serde(rename = "positions_request")]
    PositionsRequest { request_id: u64 },
    /// Request working orders, or one order when `broker_order_id` is set.
    #[serde(rename = "orders_request")]
    OrdersRequest {
        request_id: u64,
        broker_order_id: Option<String>,
    },
    /// Subscribe to market data.
    #[serde(rename = "subscribe")]
    Subscribe { request_id: u64, instrument: String },
    /// Unsubscribe from market data.
    #[serde(rename = "unsubscribe")]
    Unsubscribe { request_id: u64, instrument: String },
    /// Heartbeat.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        request_id: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Account fields as the EA reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAccount {
    pub login: String,
    pub currency: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub unrealized_pnl: Decimal,
    pub margin_used: Decimal,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePosition {
    pub instrument: String,
    /// "buy"/"long" or "sell"/"short".
    pub side: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOrder {
    pub broker_order_id: String,
    pub client_order_id: Option<String>,
    pub instrument: String,
    pub side: String,
    pub order_type: String,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: String,
}

/// Messages received FROM MetaTrader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Connection established and the hello accepted.
    #[serde(rename = "connected")]
    Connected { version: String },
    /// Request succeeded with nothing to return.
    #[serde(rename = "ack")]
    Ack { request_id: u64 },
    /// Error message, tied to a request when `request_id` is set.
    #[serde(rename = "error")]
    Error {
        request_id: Option<u64>,
        message: String,
    },
    /// Market data tick.
    #[serde(rename = "tick")]
    Tick {
        instrument: String,
        timestamp: DateTime<Utc>,
        bid: Decimal,
        ask: Decimal,
        last: Option<Decimal>,
    },
    /// Order update (accept, fill, cancel, reject, etc.).
    #[serde(rename = "order_update")]
    OrderUpdate {
        seq: u64,
        client_order_id: Option<String>,
        broker_order_id: String,
        status: String,
        /// Size of this execution, for fills.
        fill_quantity: Option<Decimal>,
        fill_price: Option<Decimal>,
        quantity: Option<Decimal>,
        price: Option<Decimal>,
        message: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    /// Account state, pushed or in reply to an account request.
    #[serde(rename = "account_update")]
    AccountUpdate {
        request_id: Option<u64>,
        account: WireAccount,
    },
    /// Position update.
    #[serde(rename = "position_update")]
    PositionUpdate { position: WirePosition },
    #[serde(rename = "positions")]
    Positions {
        request_id: u64,
        positions: Vec<WirePosition>,
    },
    #[serde(rename = "orders")]
    Orders {
        request_id: u64,
        orders: Vec<WireOrder>,
    },
    /// Heartbeat acknowledgement.
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck {
        request_id: u64,
        timestamp: DateTime<Utc>,
    },
}

impl InboundMessage {
    /// The request this message answers, if it is a reply.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            InboundMessage::Ack { request_id }
            | InboundMessage::Positions { request_id, .. }
            | InboundMessage::Orders { request_id, .. }
            | InboundMessage::HeartbeatAck { request_id, .. } => Some(*request_id),
            InboundMessage::Error { request_id, .. }
            | InboundMessage::AccountUpdate { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Normalize a push message. Replies and handshake messages map to `None`.
    pub fn into_venue_event(self) -> Option<VenueEvent> {
        match self {
            InboundMessage::Tick {
                instrument,
                timestamp,
                bid,
                ask,
                last,
            } => Some(VenueEvent::Quote(Quote {
                symbol: instrument,
                bid,
                ask,
                last,
                timestamp,
            })),
            InboundMessage::AccountUpdate {
                request_id: None,
                account,
            } => Some(VenueEvent::Account(account.into())),
            InboundMessage::PositionUpdate { position } => Some(VenueEvent::Position(position.into())),
            InboundMessage::OrderUpdate {
                seq,
                client_order_id,
                broker_order_id,
                status,
                fill_quantity,
                fill_price,
                quantity,
                price,
                message,
                timestamp,
            } => {
                let order = OrderRef::from_ids(&broker_order_id, client_order_id.as_deref());
                let reason = || message.clone().unwrap_or_else(|| status.clone());
                match status.as_str() {
                    "accepted" | "placed" => match order {
                        OrderRef::Correlation(correlation_id) => Some(VenueEvent::Accepted {
                            correlation_id,
                            venue_id: broker_order_id,
                            seq,
                        }),
                        // Placed outside the gateway; picked up by the next pull.
                        OrderRef::Venue(_) => None,
                    },
                    "partially_filled" | "filled" => Some(VenueEvent::Filled {
                        order,
                        quantity: fill_quantity?,
                        price: fill_price?,
                        seq,
                        timestamp,
                    }),
                    "modified" => Some(VenueEvent::Amended {
                        venue_id: broker_order_id,
                        quantity,
                        price,
                        seq,
                    }),
                    "cancelled" => Some(VenueEvent::Cancelled { order, seq }),
                    "rejected" => Some(VenueEvent::Rejected {
                        order,
                        reason: reason(),
                        seq,
                    }),
                    "expired" => Some(VenueEvent::Expired { order, seq }),
                    "cancel_rejected" | "modify_rejected" => Some(VenueEvent::ActionRejected {
                        venue_id: broker_order_id,
                        reason: reason(),
                        seq,
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl From<WireAccount> for Account {
    fn from(wire: WireAccount) -> Self {
        Account {
            id: wire.login,
            balance: wire.balance,
            equity: wire.equity,
            currency: wire.currency,
            unrealized_pnl: wire.unrealized_pnl,
            margin_used: wire.margin_used,
            updated_at: wire.timestamp,
        }
    }
}

impl From<WirePosition> for Position {
    fn from(wire: WirePosition) -> Self {
        let sign = match parse_side(&wire.side) {
            Some(Side::Sell) => -Decimal::ONE,
            _ => Decimal::ONE,
        };
        Position {
            symbol: wire.instrument,
            net_quantity: sign * wire.quantity.abs(),
            avg_price: wire.avg_entry_price,
            unrealized_pnl: wire.unrealized_pnl,
            updated_at: wire.timestamp,
        }
    }
}

impl TryFrom<WireOrder> for VenueOrder {
    type Error = VenueError;

    fn try_from(wire: WireOrder) -> Result<Self, Self::Error> {
        let side = parse_side(&wire.side)
            .ok_or_else(|| VenueError::Protocol(format!("unknown side {}", wire.side)))?;
        let order_type = match (wire.order_type.as_str(), wire.price) {
            ("market", _) => OrderType::Market,
            ("limit", Some(price)) => OrderType::Limit(price),
            ("stop", Some(price)) => OrderType::Stop(price),
            (other, _) => {
                return Err(VenueError::Protocol(format!("unsupported order type {other}")))
            }
        };
        let status = parse_status(&wire.status)
            .ok_or_else(|| VenueError::Protocol(format!("unknown order status {}", wire.status)))?;
        Ok(VenueOrder {
            venue_id: wire.broker_order_id,
            client_id: wire.client_order_id,
            symbol: wire.instrument,
            side,
            quantity: wire.quantity,
            filled_quantity: wire.filled_quantity,
            order_type,
            status,
        })
    }
}

pub fn parse_side(side: &str) -> Option<Side> {
    match side {
        "buy" | "long" => Some(Side::Buy),
        "sell" | "short" => Some(Side::Sell),
        _ => None,
    }
}

pub fn parse_status(status: &str) -> Option<OrderStatus> {
    match status {
        "submitted" => Some(OrderStatus::Submitted),
        "accepted" | "placed" | "modified" => Some(OrderStatus::Acknowledged),
        "partially_filled" => Some(OrderStatus::PartiallyFilled),
        "filled" => Some(OrderStatus::Filled),
        "cancelled" => Some(OrderStatus::Cancelled),
        "rejected" => Some(OrderStatus::Rejected),
        "expired" => Some(OrderStatus::Expired),
        _ => None,
    }
}

pub fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

pub fn order_type_str(order_type: &OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "market",
        OrderType::Limit(_) => "limit",
        OrderType::Stop(_) => "stop",
    }
}

pub fn time_in_force_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GoodTillCancelled => "gtc",
        TimeInForce::ImmediateOrCancel => "ioc",
        TimeInForce::FillOrKill => "fok",
        TimeInForce::Day => "day",
    }
}

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

/// Read and decode one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<InboundMessage, VenueError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| VenueError::Transport(format!("Read error: {}", e)))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        // The body cannot be skipped safely, so the stream is out of sync.
        return Err(VenueError::Transport(format!("frame of {len} bytes exceeds limit")));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| VenueError::Transport(format!("Read error: {}", e)))?;

    serde_json::from_slice(&body)
        .map_err(|e| VenueError::Protocol(format!("Deserialization error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_outbound_is_tagged() {
        let msg = OutboundMessage::OrderCancel {
            request_id: 7,
            broker_order_id: "123".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "order_cancel");
        assert_eq!(json["request_id"], 7);
    }

    #[test]
    fn test_fill_update_maps_to_correlation_id() {
        let cid = CorrelationId::next();
        let raw = format!(
            r#"{{"type":"order_update","seq":12,"client_order_id":"{cid}","broker_order_id":"5001",
               "status":"partially_filled","fill_quantity":"0.6","fill_price":"1.1050",
               "quantity":null,"price":null,"message":null,"timestamp":"2024-03-01T10:00:00Z"}}"#
        );
        let msg: InboundMessage = serde_json::from_str(&raw).unwrap();
        match msg.into_venue_event() {
            Some(VenueEvent::Filled {
                order,
                quantity,
                price,
                seq,
                ..
            }) => {
                assert_eq!(order, OrderRef::Correlation(cid));
                assert_eq!(quantity, dec!(0.6));
                assert_eq!(price, dec!(1.1050));
                assert_eq!(seq, 12);
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[test]
    fn test_foreign_accept_is_ignored() {
        let msg = InboundMessage::OrderUpdate {
            seq: 1,
            client_order_id: Some("manual".into()),
            broker_order_id: "9".into(),
            status: "accepted".into(),
            fill_quantity: None,
            fill_price: None,
            quantity: None,
            price: None,
            message: None,
            timestamp: Utc::now(),
        };
        assert!(msg.into_venue_event().is_none());
    }

    #[test]
    fn test_short_position_is_negative() {
        let position: Position = WirePosition {
            instrument: "XAUUSD".into(),
            side: "short".into(),
            quantity: dec!(2),
            avg_entry_price: dec!(2010.5),
            unrealized_pnl: dec!(-3),
            timestamp: Utc::now(),
        }
        .into();
        assert_eq!(position.net_quantity, dec!(-2));
    }

    #[test]
    fn test_reply_request_ids() {
        assert_eq!(InboundMessage::Ack { request_id: 3 }.request_id(), Some(3));
        let push = InboundMessage::Error {
            request_id: None,
            message: "boom".into(),
        };
        assert_eq!(push.request_id(), None);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let framed = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let mut reader: &[u8] = &framed;
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(VenueError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_decodes() {
        let body = serde_json::to_vec(&InboundMessage::Connected {
            version: "1.2".into(),
        })
        .unwrap();
        let framed = frame_message(&body);
        let mut reader: &[u8] = &framed;
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            InboundMessage::Connected {
                version: "1.2".into()
            }
        );
    }
}
