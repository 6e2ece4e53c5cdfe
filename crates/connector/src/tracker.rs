//! Order lifecycle tracking.
//!
//! ```text
//! Submitted -> Acknowledged -> PartiallyFilled -> Filled
//!                  |                 |
//!                  +-----------------+--> Cancelled | Rejected | Expired
//! ```
//!
//! The tracker correlates venue events with the orders the gateway issued,
//! applies them to a per-order state machine that only moves forward, and
//! notifies order update listeners once per applied transition. Venue events
//! are deduplicated per order by sequence number.
//!
//! All work here is a short synchronous critical section on one order's
//! entry; notifications are queued while that entry is held, which keeps
//! them in transition order for that order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gateway_core::*;
use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::dispatch::spawn_order_update_dispatch;
use crate::handle::{ActionHandle, ActionKind, Completion, OrderHandle};

/// An execution to be folded into the position book.
#[derive(Debug, Clone, PartialEq)]
pub struct FillDelta {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

struct PendingAction {
    id: u64,
    kind: ActionKind,
    done: Completion,
}

struct TrackedOrder {
    order: Order,
    seen: HashSet<u64>,
    ack: Option<Completion>,
    actions: VecDeque<PendingAction>,
}

impl TrackedOrder {
    fn new(order: Order, ack: Option<Completion>) -> Self {
        Self {
            order,
            seen: HashSet::new(),
            ack,
            actions: VecDeque::new(),
        }
    }

    fn resolve_ack(&mut self, outcome: Result<Order, GatewayError>) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(outcome);
        }
    }

    /// Settle every pending action once the order is terminal.
    fn settle_actions(&mut self) {
        let cid = self.order.correlation_id;
        let status = self.order.status;
        for action in self.actions.drain(..) {
            let outcome = match (action.kind, status) {
                (ActionKind::Cancel, OrderStatus::Cancelled) => Ok(self.order.clone()),
                _ => Err(GatewayError::OrderRejected {
                    correlation_id: cid,
                    reason: format!("order became {status:?} first"),
                }),
            };
            let _ = action.done.send(outcome);
        }
    }

    fn take_action(&mut self, kind: Option<ActionKind>) -> Option<PendingAction> {
        let idx = self
            .actions
            .iter()
            .position(|a| kind.map_or(true, |k| a.kind == k))?;
        self.actions.remove(idx)
    }
}

pub struct OrderTracker {
    connector: String,
    orders: DashMap<CorrelationId, TrackedOrder>,
    by_venue_id: DashMap<String, CorrelationId>,
    retired: Mutex<VecDeque<CorrelationId>>,
    retention: usize,
    ack_timeout: Duration,
    listeners: RwLock<Vec<(u64, mpsc::UnboundedSender<OrderUpdate>)>>,
    next_listener: AtomicU64,
    next_action: AtomicU64,
    events: broadcast::Sender<GatewayEvent>,
}

impl OrderTracker {
    pub fn new(
        connector: &str,
        ack_timeout: Duration,
        retention: usize,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            connector: connector.to_string(),
            orders: DashMap::new(),
            by_venue_id: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
            retention,
            ack_timeout,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            next_action: AtomicU64::new(1),
            events,
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub fn subscribe(&self, listener: Arc<dyn OrderUpdateListener>) -> u64 {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_order_update_dispatch(self.connector.clone(), listener, rx, self.events.clone());
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify(&self, previous: OrderStatus, order: &Order, fill: Option<FillDetail>) {
        let update = OrderUpdate {
            connector: self.connector.clone(),
            previous,
            order: order.clone(),
            fill,
        };
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for (_, tx) in listeners.iter() {
            let _ = tx.send(update.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Submission path
    // -----------------------------------------------------------------------

    /// Issue a correlation id and start tracking the order as `Submitted`.
    pub fn register(&self, request: &OrderRequest) -> (Order, OrderHandle) {
        let cid = CorrelationId::next();
        let order = Order::submitted(cid, request);
        let (handle, ack) = OrderHandle::new(cid);
        self.orders
            .insert(cid, TrackedOrder::new(order.clone(), Some(ack)));
        debug!(connector = %self.connector, correlation_id = %cid, symbol = %order.symbol, "Order submitted");
        (order, handle)
    }

    /// The venue call for a submission failed before any acknowledgement.
    pub fn submission_failed(&self, cid: CorrelationId, error: &VenueError) {
        let terminal = {
            let Some(mut tracked) = self.orders.get_mut(&cid) else {
                return;
            };
            if tracked.order.status != OrderStatus::Submitted {
                return;
            }
            let reason = error.to_string();
            warn!(connector = %self.connector, correlation_id = %cid, reason = %reason, "Order submission failed");
            tracked.order.reject_cause = Some(RejectCause::Venue(reason.clone()));
            self.advance(&mut tracked, OrderStatus::Rejected, None);
            tracked.resolve_ack(Err(GatewayError::OrderRejected {
                correlation_id: cid,
                reason,
            }));
            tracked.settle_actions();
            true
        };
        if terminal {
            self.retire(cid);
        }
    }

    /// Reject an order that is still waiting for its acknowledgement.
    pub fn expire_unacked(&self, cid: CorrelationId) -> bool {
        let expired = {
            let Some(mut tracked) = self.orders.get_mut(&cid) else {
                return false;
            };
            if tracked.order.status != OrderStatus::Submitted {
                return false;
            }
            warn!(connector = %self.connector, correlation_id = %cid, "No acknowledgement in time, rejecting");
            tracked.order.reject_cause = Some(RejectCause::Timeout);
            self.advance(&mut tracked, OrderStatus::Rejected, None);
            tracked.resolve_ack(Err(GatewayError::Timeout {
                operation: format!("acknowledgement of {cid}"),
                after: self.ack_timeout,
            }));
            tracked.settle_actions();
            true
        };
        if expired {
            let _ = self.events.send(GatewayEvent::OrderTimedOut {
                connector: self.connector.clone(),
                correlation_id: cid,
            });
            self.retire(cid);
        }
        expired
    }

    // -----------------------------------------------------------------------
    // Modify / cancel
    // -----------------------------------------------------------------------

    /// Register a pending amend or cancel. Returns the venue id to address.
    pub fn begin_action(
        &self,
        cid: CorrelationId,
        kind: ActionKind,
    ) -> Result<(String, u64, ActionHandle), GatewayError> {
        let mut tracked = self
            .orders
            .get_mut(&cid)
            .ok_or_else(|| GatewayError::NotFound(format!("order {cid}")))?;
        if tracked.order.status.is_terminal() {
            return Err(GatewayError::Validation(format!(
                "order {cid} is already {:?}",
                tracked.order.status
            )));
        }
        let venue_id = tracked.order.venue_id.clone().ok_or_else(|| {
            GatewayError::Validation(format!("order {cid} is not acknowledged yet"))
        })?;
        let id = self.next_action.fetch_add(1, Ordering::Relaxed);
        let (handle, done) = ActionHandle::new(cid, kind);
        tracked.actions.push_back(PendingAction { id, kind, done });
        Ok((venue_id, id, handle))
    }

    pub fn action_failed(&self, cid: CorrelationId, action_id: u64, error: VenueError) {
        let Some(mut tracked) = self.orders.get_mut(&cid) else {
            return;
        };
        let Some(idx) = tracked.actions.iter().position(|a| a.id == action_id) else {
            return;
        };
        if let Some(action) = tracked.actions.remove(idx) {
            let outcome = match error {
                VenueError::Rejected(reason) => GatewayError::OrderRejected {
                    correlation_id: cid,
                    reason,
                },
                other => GatewayError::from(other),
            };
            let _ = action.done.send(Err(outcome));
        }
    }

    pub fn expire_action(&self, cid: CorrelationId, action_id: u64) {
        let Some(mut tracked) = self.orders.get_mut(&cid) else {
            return;
        };
        let Some(idx) = tracked.actions.iter().position(|a| a.id == action_id) else {
            return;
        };
        if let Some(action) = tracked.actions.remove(idx) {
            let operation = match action.kind {
                ActionKind::Amend => format!("amend of {cid}"),
                ActionKind::Cancel => format!("cancel of {cid}"),
            };
            let _ = action.done.send(Err(GatewayError::Timeout {
                operation,
                after: self.ack_timeout,
            }));
        }
    }

    /// Resolve every outstanding handle with `Cancelled`. Order states are
    /// left alone; late venue events still apply normally.
    pub fn cancel_pending(&self, reason: &str) -> usize {
        let mut cancelled = 0;
        for mut tracked in self.orders.iter_mut() {
            if let Some(ack) = tracked.ack.take() {
                let _ = ack.send(Err(GatewayError::Cancelled(reason.to_string())));
                cancelled += 1;
            }
            for action in tracked.actions.drain(..) {
                let _ = action.done.send(Err(GatewayError::Cancelled(reason.to_string())));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(connector = %self.connector, cancelled, reason, "Cancelled pending order operations");
        }
        cancelled
    }

    // -----------------------------------------------------------------------
    // Venue events
    // -----------------------------------------------------------------------

    /// Apply one venue order event. Returns the execution when the event
    /// was an applied fill.
    pub fn apply(&self, event: VenueEvent) -> Option<FillDelta> {
        let (target, seq) = match &event {
            VenueEvent::Accepted {
                correlation_id,
                seq,
                ..
            } => (OrderRef::Correlation(*correlation_id), *seq),
            VenueEvent::Amended { venue_id, seq, .. }
            | VenueEvent::ActionRejected { venue_id, seq, .. } => {
                (OrderRef::Venue(venue_id.clone()), *seq)
            }
            VenueEvent::Filled { order, seq, .. }
            | VenueEvent::Cancelled { order, seq }
            | VenueEvent::Rejected { order, seq, .. }
            | VenueEvent::Expired { order, seq } => (order.clone(), *seq),
            _ => return None,
        };

        let Some(cid) = self.resolve(&target) else {
            self.dropped(format!("event for unknown order {target:?}"));
            return None;
        };

        let (outcome, terminal) = {
            let Some(mut tracked) = self.orders.get_mut(&cid) else {
                self.dropped(format!("event for retired order {cid}"));
                return None;
            };
            if !tracked.seen.insert(seq) {
                drop(tracked);
                self.dropped(format!("duplicate event seq {seq} for {cid}"));
                return None;
            }
            let was_terminal = tracked.order.status.is_terminal();
            let outcome = self.apply_to(&mut tracked, event);
            let terminal = !was_terminal && tracked.order.status.is_terminal();
            if terminal {
                tracked.settle_actions();
            }
            (outcome, terminal)
        };

        if terminal {
            self.retire(cid);
        }
        match outcome {
            Ok(delta) => delta,
            Err(reason) => {
                self.dropped(format!("{cid}: {reason}"));
                None
            }
        }
    }

    fn apply_to(
        &self,
        tracked: &mut TrackedOrder,
        event: VenueEvent,
    ) -> Result<Option<FillDelta>, String> {
        let status = tracked.order.status;
        if status.is_terminal() {
            return Err(format!("order already {status:?}"));
        }
        let cid = tracked.order.correlation_id;

        match event {
            VenueEvent::Accepted { venue_id, .. } => {
                if status != OrderStatus::Submitted {
                    return Err(format!("acknowledgement after {status:?}"));
                }
                self.acknowledge(tracked, Some(venue_id));
                Ok(None)
            }
            VenueEvent::Filled {
                quantity,
                price,
                timestamp,
                ..
            } => {
                if quantity <= Decimal::ZERO {
                    return Err(format!("non-positive fill quantity {quantity}"));
                }
                if status == OrderStatus::Submitted {
                    self.acknowledge(tracked, None);
                }
                let order = &mut tracked.order;
                let filled = order.filled_quantity + quantity;
                let notional = order.avg_fill_price.unwrap_or(Decimal::ZERO)
                    * order.filled_quantity
                    + price * quantity;
                order.avg_fill_price = Some(notional / filled);
                order.filled_quantity = filled;
                if filled > order.quantity {
                    warn!(connector = %self.connector, correlation_id = %cid, "Fill exceeds order quantity");
                }
                let to = if filled >= order.quantity {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                let delta = FillDelta {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    quantity,
                    price,
                    timestamp,
                };
                self.advance(
                    tracked,
                    to,
                    Some(FillDetail {
                        quantity,
                        price,
                        timestamp,
                    }),
                );
                Ok(Some(delta))
            }
            VenueEvent::Cancelled { .. } => {
                tracked.resolve_ack(Err(GatewayError::Cancelled(format!(
                    "order {cid} cancelled by venue before acknowledgement"
                ))));
                self.advance(tracked, OrderStatus::Cancelled, None);
                Ok(None)
            }
            VenueEvent::Rejected { reason, .. } => {
                tracked.order.reject_cause = Some(RejectCause::Venue(reason.clone()));
                self.advance(tracked, OrderStatus::Rejected, None);
                tracked.resolve_ack(Err(GatewayError::OrderRejected {
                    correlation_id: cid,
                    reason,
                }));
                Ok(None)
            }
            VenueEvent::Expired { .. } => {
                tracked.resolve_ack(Err(GatewayError::OrderRejected {
                    correlation_id: cid,
                    reason: "order expired before acknowledgement".to_string(),
                }));
                self.advance(tracked, OrderStatus::Expired, None);
                Ok(None)
            }
            VenueEvent::Amended {
                quantity, price, ..
            } => {
                if status == OrderStatus::Submitted {
                    return Err("amendment before acknowledgement".to_string());
                }
                if let Some(q) = quantity {
                    tracked.order.quantity = q;
                }
                if let Some(p) = price {
                    tracked.order.order_type = match tracked.order.order_type {
                        OrderType::Limit(_) => OrderType::Limit(p),
                        OrderType::Stop(_) => OrderType::Stop(p),
                        OrderType::Market => OrderType::Market,
                    };
                }
                self.advance(tracked, status, None);
                if let Some(action) = tracked.take_action(Some(ActionKind::Amend)) {
                    let _ = action.done.send(Ok(tracked.order.clone()));
                }
                Ok(None)
            }
            VenueEvent::ActionRejected { reason, .. } => match tracked.take_action(None) {
                Some(action) => {
                    let _ = action.done.send(Err(GatewayError::OrderRejected {
                        correlation_id: cid,
                        reason,
                    }));
                    Ok(None)
                }
                None => Err("action rejection with nothing pending".to_string()),
            },
            _ => Ok(None),
        }
    }

    fn acknowledge(&self, tracked: &mut TrackedOrder, venue_id: Option<String>) {
        if let Some(venue_id) = venue_id {
            self.by_venue_id
                .insert(venue_id.clone(), tracked.order.correlation_id);
            tracked.order.venue_id = Some(venue_id);
        }
        self.advance(tracked, OrderStatus::Acknowledged, None);
        let snapshot = tracked.order.clone();
        tracked.resolve_ack(Ok(snapshot));
    }

    fn advance(&self, tracked: &mut TrackedOrder, to: OrderStatus, fill: Option<FillDetail>) {
        let previous = tracked.order.status;
        let now = Utc::now();
        tracked.order.status = to;
        if to == OrderStatus::Acknowledged && tracked.order.acknowledged_at.is_none() {
            tracked.order.acknowledged_at = Some(now);
        }
        if to.is_terminal() {
            tracked.order.terminal_at = Some(now);
        }
        debug!(
            connector = %self.connector,
            correlation_id = %tracked.order.correlation_id,
            from = ?previous,
            to = ?to,
            "Order transition"
        );
        self.notify(previous, &tracked.order, fill);
    }

    fn resolve(&self, target: &OrderRef) -> Option<CorrelationId> {
        match target {
            OrderRef::Correlation(cid) => Some(*cid),
            OrderRef::Venue(venue_id) => self.by_venue_id.get(venue_id).map(|c| *c),
        }
    }

    fn dropped(&self, reason: String) {
        debug!(connector = %self.connector, reason = %reason, "Venue event dropped");
        let _ = self.events.send(GatewayEvent::VenueEventDropped {
            connector: self.connector.clone(),
            reason,
        });
    }

    /// Move a terminal order into the bounded terminal store.
    fn retire(&self, cid: CorrelationId) {
        let evicted: Vec<CorrelationId> = {
            let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
            retired.push_back(cid);
            let excess = retired.len().saturating_sub(self.retention);
            retired.drain(..excess).collect()
        };
        for old in evicted {
            if let Some((_, tracked)) = self.orders.remove(&old) {
                if let Some(venue_id) = tracked.order.venue_id {
                    self.by_venue_id.remove(&venue_id);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, cid: CorrelationId) -> Option<Order> {
        self.orders.get(&cid).map(|t| t.order.clone())
    }

    pub fn find_by_venue_id(&self, venue_id: &str) -> Option<Order> {
        let cid = self.by_venue_id.get(venue_id).map(|c| *c)?;
        self.get(cid)
    }

    pub fn open_orders(&self) -> Vec<Order> {
        let mut open: Vec<Order> = self
            .orders
            .iter()
            .filter(|t| t.order.is_active())
            .map(|t| t.order.clone())
            .collect();
        open.sort_by_key(|o| o.correlation_id);
        open
    }

    /// Start tracking an order the venue reports but the gateway never
    /// issued (placed elsewhere, or before a restart). It gets a fresh
    /// correlation id.
    pub fn adopt(&self, venue_order: &VenueOrder) -> Order {
        if let Some(existing) = self.find_by_venue_id(&venue_order.venue_id) {
            return existing;
        }
        if let Some(existing) = venue_order
            .client_id
            .as_deref()
            .and_then(|c| c.parse::<CorrelationId>().ok())
            .and_then(|cid| self.get(cid))
        {
            return existing;
        }

        let cid = CorrelationId::next();
        let now = Utc::now();
        let order = Order {
            correlation_id: cid,
            venue_id: Some(venue_order.venue_id.clone()),
            symbol: venue_order.symbol.clone(),
            side: venue_order.side,
            quantity: venue_order.quantity,
            filled_quantity: venue_order.filled_quantity,
            avg_fill_price: None,
            order_type: venue_order.order_type,
            time_in_force: TimeInForce::GoodTillCancelled,
            status: venue_order.status,
            submitted_at: now,
            acknowledged_at: Some(now),
            terminal_at: venue_order.status.is_terminal().then_some(now),
            reject_cause: None,
        };
        self.by_venue_id.insert(venue_order.venue_id.clone(), cid);
        self.orders.insert(cid, TrackedOrder::new(order.clone(), None));
        info!(connector = %self.connector, correlation_id = %cid, venue_id = %venue_order.venue_id, "Adopted venue order");
        if order.status.is_terminal() {
            self.retire(cid);
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Recorder {
        updates: AsyncMutex<Vec<OrderUpdate>>,
    }

    #[async_trait]
    impl OrderUpdateListener for Recorder {
        async fn on_order_update(&self, update: &OrderUpdate) -> Result<(), ListenerError> {
            self.updates.lock().await.push(update.clone());
            Ok(())
        }
    }

    fn tracker() -> OrderTracker {
        let (tx, _) = broadcast::channel(64);
        OrderTracker::new("test", Duration::from_millis(100), 100, tx)
    }

    fn fill(cid: CorrelationId, qty: Decimal, seq: u64) -> VenueEvent {
        VenueEvent::Filled {
            order: OrderRef::Correlation(cid),
            quantity: qty,
            price: dec!(1.1),
            seq,
            timestamp: Utc::now(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_ack_partial_fill_fill() {
        let tracker = tracker();
        let recorder = Arc::new(Recorder::default());
        tracker.subscribe(recorder.clone());

        let (order, handle) = tracker.register(&OrderRequest::market("EURUSD", Side::Buy, dec!(100)));
        let cid = order.correlation_id;
        tracker.apply(VenueEvent::Accepted {
            correlation_id: cid,
            venue_id: "V1".into(),
            seq: 1,
        });
        let acked = handle.await.unwrap();
        assert_eq!(acked.status, OrderStatus::Acknowledged);
        assert_eq!(acked.venue_id.as_deref(), Some("V1"));

        assert!(tracker.apply(fill(cid, dec!(60), 2)).is_some());
        assert!(tracker.apply(fill(cid, dec!(40), 3)).is_some());

        let order = tracker.get(cid).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(100));

        settle().await;
        let statuses: Vec<OrderStatus> = recorder
            .updates
            .lock()
            .await
            .iter()
            .map(|u| u.order.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                OrderStatus::Acknowledged,
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_state_absorbs_later_events() {
        let tracker = tracker();
        let recorder = Arc::new(Recorder::default());
        tracker.subscribe(recorder.clone());

        let (order, _handle) = tracker.register(&OrderRequest::market("EURUSD", Side::Sell, dec!(10)));
        let cid = order.correlation_id;
        tracker.apply(VenueEvent::Accepted {
            correlation_id: cid,
            venue_id: "V2".into(),
            seq: 10,
        });
        tracker.apply(fill(cid, dec!(10), 11));
        // Duplicate fill, then a cancel after the order is already filled.
        assert!(tracker.apply(fill(cid, dec!(10), 11)).is_none());
        tracker.apply(VenueEvent::Cancelled {
            order: OrderRef::Venue("V2".into()),
            seq: 12,
        });

        assert_eq!(tracker.get(cid).unwrap().status, OrderStatus::Filled);
        settle().await;
        assert_eq!(recorder.updates.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_ignored() {
        let tracker = tracker();
        let recorder = Arc::new(Recorder::default());
        tracker.subscribe(recorder.clone());

        let (order, _handle) = tracker.register(&OrderRequest::market("EURUSD", Side::Buy, dec!(1)));
        let accepted = VenueEvent::Accepted {
            correlation_id: order.correlation_id,
            venue_id: "V3".into(),
            seq: 5,
        };
        tracker.apply(accepted.clone());
        tracker.apply(accepted);

        settle().await;
        assert_eq!(recorder.updates.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_timeout_rejects_once() {
        let tracker = tracker();
        let (order, handle) = tracker.register(&OrderRequest::market("EURUSD", Side::Buy, dec!(1)));
        let cid = order.correlation_id;

        assert!(tracker.expire_unacked(cid));
        assert!(!tracker.expire_unacked(cid));

        match handle.await {
            Err(GatewayError::Timeout { .. }) => {}
            other => panic!("Expected timeout, got {:?}", other),
        }
        let order = tracker.get(cid).unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.reject_cause, Some(RejectCause::Timeout));

        // A late acknowledgement cannot revive the order.
        tracker.apply(VenueEvent::Accepted {
            correlation_id: cid,
            venue_id: "late".into(),
            seq: 1,
        });
        assert_eq!(tracker.get(cid).unwrap().status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_cancel_action_resolves_on_venue_cancel() {
        let tracker = tracker();
        let (order, _handle) = tracker.register(&OrderRequest::limit("EURUSD", Side::Buy, dec!(5), dec!(1.05)));
        let cid = order.correlation_id;

        assert!(tracker.begin_action(cid, ActionKind::Cancel).is_err());

        tracker.apply(VenueEvent::Accepted {
            correlation_id: cid,
            venue_id: "V4".into(),
            seq: 1,
        });
        let (venue_id, _, action) = tracker.begin_action(cid, ActionKind::Cancel).unwrap();
        assert_eq!(venue_id, "V4");

        tracker.apply(VenueEvent::Cancelled {
            order: OrderRef::Venue("V4".into()),
            seq: 2,
        });
        let cancelled = action.await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_pending_resolves_handles() {
        let tracker = tracker();
        let (_, handle) = tracker.register(&OrderRequest::market("EURUSD", Side::Buy, dec!(1)));
        assert_eq!(tracker.cancel_pending("disconnect"), 1);
        assert!(matches!(handle.await, Err(GatewayError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest_terminal_orders() {
        let (tx, _) = broadcast::channel(64);
        let tracker = OrderTracker::new("test", Duration::from_millis(100), 1, tx);

        let (first, _h1) = tracker.register(&OrderRequest::market("EURUSD", Side::Buy, dec!(1)));
        let (second, _h2) = tracker.register(&OrderRequest::market("EURUSD", Side::Buy, dec!(1)));
        tracker.expire_unacked(first.correlation_id);
        assert!(tracker.get(first.correlation_id).is_some());
        tracker.expire_unacked(second.correlation_id);

        assert!(tracker.get(first.correlation_id).is_none());
        assert!(tracker.get(second.correlation_id).is_some());
    }

    #[tokio::test]
    async fn test_adopted_terminal_orders_respect_retention() {
        let (tx, _) = broadcast::channel(64);
        let tracker = OrderTracker::new("test", Duration::from_millis(100), 1, tx);
        let finished = |venue_id: &str| VenueOrder {
            venue_id: venue_id.to_string(),
            client_id: None,
            symbol: "EURUSD".into(),
            side: Side::Sell,
            quantity: dec!(5),
            filled_quantity: dec!(5),
            order_type: OrderType::Market,
            status: OrderStatus::Filled,
        };

        let first = tracker.adopt(&finished("V-1"));
        let second = tracker.adopt(&finished("V-2"));

        assert!(tracker.get(first.correlation_id).is_none());
        assert!(tracker.find_by_venue_id("V-1").is_none());
        assert_eq!(tracker.get(second.correlation_id).unwrap().status, OrderStatus::Filled);
        assert!(tracker.open_orders().is_empty());
    }
}
