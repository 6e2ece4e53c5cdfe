use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::*;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Configuration for the simulated venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedVenueConfig {
    /// Name the connector reports for this venue.
    pub name: String,
    pub account_id: String,
    /// Starting account balance.
    pub initial_balance: Decimal,
    pub currency: String,
    /// Acknowledge submissions as soon as they arrive. When off, orders wait
    /// for [`SimulatedVenue::acknowledge`].
    pub auto_ack: bool,
}

impl Default for SimulatedVenueConfig {
    fn default() -> Self {
        Self {
            name: "Simulated".to_string(),
            account_id: "SIM-001".to_string(),
            initial_balance: Decimal::new(50_000, 0),
            currency: "USD".to_string(),
            auto_ack: true,
        }
    }
}

#[derive(Default)]
struct SimState {
    sink: Option<VenueSink>,
    auto_ack: bool,
    fail_opens: u32,
    heartbeat_failing: bool,
    reject_next: Option<String>,
    opens: usize,
    subscribe_calls: HashMap<String, usize>,
    subscribed: HashSet<String>,
    quotes: HashMap<String, Quote>,
    /// Submissions waiting for a manual acknowledgement.
    pending: Vec<(CorrelationId, OrderRequest)>,
    orders: HashMap<String, VenueOrder>,
    positions: HashMap<String, Position>,
    balance: Decimal,
    next_order: u64,
    seq: u64,
}

/// An in-process venue for tests and dry runs.
///
/// Market orders fill against the last quote for their symbol; limit and
/// stop orders rest until a quote crosses them. Test hooks let callers
/// drop the transport, fail reconnects and hold back acknowledgements.
pub struct SimulatedVenue {
    config: SimulatedVenueConfig,
    state: Mutex<SimState>,
}

impl SimulatedVenue {
    pub fn new(config: SimulatedVenueConfig) -> Self {
        let state = SimState {
            auto_ack: config.auto_ack,
            balance: config.initial_balance,
            next_order: 1,
            ..SimState::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Test hooks
    // -----------------------------------------------------------------------

    /// Make the next `count` calls to `open` fail with a transport error.
    pub fn fail_next_opens(&self, count: u32) {
        self.state().fail_opens = count;
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state().auto_ack = auto_ack;
    }

    pub fn set_heartbeat_failing(&self, failing: bool) {
        self.state().heartbeat_failing = failing;
    }

    /// Reject the next submission with `reason`.
    pub fn reject_next_submit(&self, reason: &str) {
        self.state().reject_next = Some(reason.to_string());
    }

    /// Drop the transport as if the network went away.
    pub fn drop_transport(&self, reason: &str) {
        let mut state = self.state();
        if let Some(sink) = state.sink.take() {
            info!(venue = %self.config.name, reason, "Simulated transport dropped");
            let _ = sink.send(VenueEvent::TransportLost {
                reason: reason.to_string(),
            });
        }
        state.subscribed.clear();
    }

    /// Push a raw event to the connector, bypassing the simulation.
    pub fn inject(&self, event: VenueEvent) -> bool {
        match &self.state().sink {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    /// Set the current price of `symbol`. Resting orders it crosses are
    /// filled, and the quote is pushed if the symbol is subscribed.
    pub fn set_quote(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let quote = Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            last: None,
            timestamp: Utc::now(),
        };
        let mut state = self.state();
        state.quotes.insert(symbol.to_string(), quote.clone());
        if state.subscribed.contains(symbol) {
            state.emit(VenueEvent::Quote(quote.clone()));
        }
        state.match_resting(&quote);
    }

    /// Acknowledge a submission held back while auto-ack was off.
    pub fn acknowledge(&self, correlation_id: CorrelationId) -> Option<String> {
        let mut state = self.state();
        let index = state.pending.iter().position(|(cid, _)| *cid == correlation_id)?;
        let (cid, request) = state.pending.remove(index);
        Some(state.accept(cid, &request))
    }

    /// Fill part or all of a working order at `price`.
    pub fn fill(&self, venue_id: &str, quantity: Decimal, price: Decimal) -> bool {
        self.state().execute(venue_id, Some(quantity), price)
    }

    /// Create a working order that did not come through the gateway.
    pub fn place_external_order(&self, symbol: &str, side: Side, quantity: Decimal, price: Decimal) -> String {
        let mut state = self.state();
        let venue_id = state.next_venue_id();
        state.orders.insert(
            venue_id.clone(),
            VenueOrder {
                venue_id: venue_id.clone(),
                client_id: None,
                symbol: symbol.to_string(),
                side,
                quantity,
                filled_quantity: Decimal::ZERO,
                order_type: OrderType::Limit(price),
                status: OrderStatus::Acknowledged,
            },
        );
        venue_id
    }

    /// Overwrite the venue's position in `symbol`.
    pub fn set_position(&self, position: Position) {
        let mut state = self.state();
        if position.is_flat() {
            state.positions.remove(&position.symbol);
        } else {
            state.positions.insert(position.symbol.clone(), position);
        }
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    /// How many times the venue was asked to subscribe `symbol`.
    pub fn subscribe_count(&self, symbol: &str) -> usize {
        self.state().subscribe_calls.get(symbol).copied().unwrap_or(0)
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.state().subscribed.contains(symbol)
    }

    pub fn is_open(&self) -> bool {
        self.state().sink.is_some()
    }
}

impl SimState {
    fn emit(&self, event: VenueEvent) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(event);
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn next_venue_id(&mut self) -> String {
        let id = format!("SIM-{}", self.next_order);
        self.next_order += 1;
        id
    }

    fn accept(&mut self, cid: CorrelationId, request: &OrderRequest) -> String {
        let venue_id = self.next_venue_id();
        let seq = self.next_seq();
        self.emit(VenueEvent::Accepted {
            correlation_id: cid,
            venue_id: venue_id.clone(),
            seq,
        });
        self.orders.insert(
            venue_id.clone(),
            VenueOrder {
                venue_id: venue_id.clone(),
                client_id: Some(cid.to_string()),
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                filled_quantity: Decimal::ZERO,
                order_type: request.order_type,
                status: OrderStatus::Acknowledged,
            },
        );

        if request.order_type == OrderType::Market {
            match self.quotes.get(&request.symbol).cloned() {
                Some(quote) => {
                    let price = match request.side {
                        Side::Buy => quote.ask,
                        Side::Sell => quote.bid,
                    };
                    self.execute(&venue_id, None, price);
                }
                None => {
                    let seq = self.next_seq();
                    if let Some(order) = self.orders.get_mut(&venue_id) {
                        order.status = OrderStatus::Rejected;
                    }
                    self.emit(VenueEvent::Rejected {
                        order: OrderRef::Venue(venue_id.clone()),
                        reason: format!("no price for {}", request.symbol),
                        seq,
                    });
                }
            }
        } else if let Some(quote) = self.quotes.get(&request.symbol).cloned() {
            self.match_resting(&quote);
        }
        venue_id
    }

    /// Fill `quantity` (or the remainder) of a working order.
    fn execute(&mut self, venue_id: &str, quantity: Option<Decimal>, price: Decimal) -> bool {
        let Some(order) = self.orders.get_mut(venue_id) else {
            return false;
        };
        if order.status.is_terminal() {
            return false;
        }
        let remaining = order.quantity - order.filled_quantity;
        let quantity = quantity.unwrap_or(remaining).min(remaining);
        if quantity <= Decimal::ZERO {
            return false;
        }
        order.filled_quantity += quantity;
        order.status = if order.filled_quantity >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let (symbol, side) = (order.symbol.clone(), order.side);

        let now = Utc::now();
        self.net_position(&symbol, side, quantity, price, now);
        let seq = self.next_seq();
        self.emit(VenueEvent::Filled {
            order: OrderRef::Venue(venue_id.to_string()),
            quantity,
            price,
            seq,
            timestamp: now,
        });
        true
    }

    fn net_position(&mut self, symbol: &str, side: Side, quantity: Decimal, price: Decimal, at: DateTime<Utc>) {
        let (held, avg) = self
            .positions
            .get(symbol)
            .map(|p| (p.net_quantity, p.avg_price))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        let delta = side.sign() * quantity;
        let net = held + delta;

        // Realize P&L on the closed portion.
        if !held.is_zero() && (held > Decimal::ZERO) != (delta > Decimal::ZERO) {
            let closed = quantity.min(held.abs());
            self.balance += (price - avg) * closed * held.signum();
        }

        if net.is_zero() {
            self.positions.remove(symbol);
            return;
        }
        let avg_price = if held.is_zero() || (held > Decimal::ZERO) != (net > Decimal::ZERO) {
            price
        } else if (held > Decimal::ZERO) == (delta > Decimal::ZERO) {
            (avg * held.abs() + price * quantity) / net.abs()
        } else {
            avg
        };
        self.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                net_quantity: net,
                avg_price,
                unrealized_pnl: (price - avg_price) * net,
                updated_at: at,
            },
        );
    }

    /// Fill resting limit and stop orders crossed by `quote`.
    fn match_resting(&mut self, quote: &Quote) {
        let crossed: Vec<(String, Decimal)> = self
            .orders
            .values()
            .filter(|o| o.symbol == quote.symbol && !o.status.is_terminal())
            .filter_map(|o| {
                let touch = match o.side {
                    Side::Buy => quote.ask,
                    Side::Sell => quote.bid,
                };
                let triggered = match (o.order_type, o.side) {
                    (OrderType::Limit(limit), Side::Buy) => touch <= limit,
                    (OrderType::Limit(limit), Side::Sell) => touch >= limit,
                    (OrderType::Stop(stop), Side::Buy) => touch >= stop,
                    (OrderType::Stop(stop), Side::Sell) => touch <= stop,
                    (OrderType::Market, _) => false,
                };
                triggered.then(|| (o.venue_id.clone(), touch))
            })
            .collect();
        for (venue_id, price) in crossed {
            self.execute(&venue_id, None, price);
        }
    }

    fn unrealized(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| match self.quotes.get(&p.symbol) {
                Some(quote) => p.pnl_at(quote.mid()),
                None => p.unrealized_pnl,
            })
            .sum()
    }
}

#[async_trait]
impl VenueAdapter for SimulatedVenue {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn open(&self, sink: VenueSink) -> Result<(), VenueError> {
        let mut state = self.state();
        state.opens += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(VenueError::Transport("simulated connect failure".to_string()));
        }
        state.sink = Some(sink);
        debug!(venue = %self.config.name, "Simulated transport open");
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state();
        state.sink = None;
        state.subscribed.clear();
    }

    async fn heartbeat(&self) -> Result<(), VenueError> {
        let state = self.state();
        if state.heartbeat_failing || state.sink.is_none() {
            return Err(VenueError::Transport("no heartbeat reply".to_string()));
        }
        Ok(())
    }

    async fn fetch_account(&self) -> Result<Account, VenueError> {
        let state = self.state();
        let unrealized = state.unrealized();
        Ok(Account {
            id: self.config.account_id.clone(),
            balance: state.balance,
            equity: state.balance + unrealized,
            currency: self.config.currency.clone(),
            unrealized_pnl: unrealized,
            margin_used: Decimal::ZERO,
            updated_at: Utc::now(),
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, VenueError> {
        Ok(self.state().positions.values().cloned().collect())
    }

    async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        Ok(self
            .state()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn fetch_order(&self, venue_id: &str) -> Result<Option<VenueOrder>, VenueError> {
        Ok(self.state().orders.get(venue_id).cloned())
    }

    async fn submit_order(
        &self,
        correlation_id: CorrelationId,
        request: &OrderRequest,
    ) -> Result<(), VenueError> {
        let mut state = self.state();
        if state.sink.is_none() {
            return Err(VenueError::Transport("not connected".to_string()));
        }
        if let Some(reason) = state.reject_next.take() {
            let seq = state.next_seq();
            state.emit(VenueEvent::Rejected {
                order: OrderRef::Correlation(correlation_id),
                reason,
                seq,
            });
            return Ok(());
        }
        if state.auto_ack {
            state.accept(correlation_id, request);
        } else {
            state.pending.push((correlation_id, request.clone()));
        }
        Ok(())
    }

    async fn amend_order(&self, venue_id: &str, amendment: &OrderAmendment) -> Result<(), VenueError> {
        let mut state = self.state();
        let Some(order) = state.orders.get_mut(venue_id) else {
            return Err(VenueError::NotFound(venue_id.to_string()));
        };
        if order.status.is_terminal() {
            let seq = state.next_seq();
            state.emit(VenueEvent::ActionRejected {
                venue_id: venue_id.to_string(),
                reason: "order is no longer working".to_string(),
                seq,
            });
            return Ok(());
        }
        if let Some(quantity) = amendment.quantity {
            order.quantity = quantity;
        }
        if let Some(price) = amendment.price {
            order.order_type = match order.order_type {
                OrderType::Limit(_) => OrderType::Limit(price),
                OrderType::Stop(_) => OrderType::Stop(price),
                OrderType::Market => OrderType::Market,
            };
        }
        let seq = state.next_seq();
        state.emit(VenueEvent::Amended {
            venue_id: venue_id.to_string(),
            quantity: amendment.quantity,
            price: amendment.price,
            seq,
        });
        Ok(())
    }

    async fn cancel_order(&self, venue_id: &str) -> Result<(), VenueError> {
        let mut state = self.state();
        let Some(order) = state.orders.get_mut(venue_id) else {
            return Err(VenueError::NotFound(venue_id.to_string()));
        };
        let working = !order.status.is_terminal();
        if working {
            order.status = OrderStatus::Cancelled;
        }
        let seq = state.next_seq();
        state.emit(if working {
            VenueEvent::Cancelled {
                order: OrderRef::Venue(venue_id.to_string()),
                seq,
            }
        } else {
            VenueEvent::ActionRejected {
                venue_id: venue_id.to_string(),
                reason: "order is no longer working".to_string(),
                seq,
            }
        });
        Ok(())
    }

    async fn subscribe(&self, symbol: &str) -> Result<(), VenueError> {
        let mut state = self.state();
        *state.subscribe_calls.entry(symbol.to_string()).or_default() += 1;
        state.subscribed.insert(symbol.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<(), VenueError> {
        self.state().subscribed.remove(symbol);
        Ok(())
    }
}
