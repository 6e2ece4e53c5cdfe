use chrono::Utc;
use dashmap::DashMap;
use gateway_core::*;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::handle::{ActionHandle, ActionKind, OrderHandle};
use crate::hub::{FanOutHub, HubSubscription};
use crate::lifecycle::{ConnectStart, Lifecycle};
use crate::reconciler::{ReconciledView, Reconciler};
use crate::tracker::OrderTracker;

/// Background tasks bound to one open transport.
struct Session {
    ingest: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl Session {
    fn stop(self) {
        self.ingest.abort();
        self.supervisor.abort();
    }
}

struct Inner {
    name: String,
    adapter: Arc<dyn VenueAdapter>,
    config: ConnectorConfig,
    lifecycle: Lifecycle,
    tracker: OrderTracker,
    hub: FanOutHub,
    reconciler: Reconciler,
    events: broadcast::Sender<GatewayEvent>,
    /// Serializes hub changes and venue (un)subscribe calls per symbol.
    symbol_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    session: Mutex<Option<Session>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

/// A venue connection with the full gateway capability set.
///
/// `Connector` is venue-agnostic: everything venue-specific sits behind the
/// [`VenueAdapter`] it wraps. Cloning is cheap and every clone drives the
/// same connection.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    pub fn new(adapter: Arc<dyn VenueAdapter>, config: ConnectorConfig) -> Self {
        let name = adapter.name().to_string();
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let inner = Inner {
            lifecycle: Lifecycle::new(&name, config.backoff.clone(), events.clone()),
            tracker: OrderTracker::new(
                &name,
                config.ack_timeout(),
                config.terminal_retention,
                events.clone(),
            ),
            hub: FanOutHub::new(&name, config.market_data_queue, events.clone()),
            reconciler: Reconciler::new(&name, events.clone()),
            name,
            adapter,
            config,
            events,
            symbol_locks: DashMap::new(),
            session: Mutex::new(None),
            reconnect: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Static identity of the venue, for routing and logs.
    pub fn get_connector_name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lifecycle.is_connected()
    }

    /// The terminal connection error while the connector is `Failed`.
    pub fn failure(&self) -> Option<ConnectionError> {
        self.inner.lifecycle.failure()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectorState> {
        self.inner.lifecycle.watch()
    }

    /// Structured observability stream (state changes, drops, failures).
    pub fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Connect to the venue. Calling this while connected returns at once
    /// without opening a second transport; while another connect is running
    /// it waits for that attempt's outcome.
    pub async fn connect(&self) -> Result<ConnectorState, GatewayError> {
        let mut state = self.inner.lifecycle.watch();
        loop {
            match self.inner.lifecycle.begin_connect() {
                ConnectStart::AlreadyConnected => return Ok(ConnectorState::Connected),
                ConnectStart::Started => break,
                ConnectStart::InProgress => {
                    let settled = loop {
                        let current = *state.borrow_and_update();
                        if !matches!(
                            current,
                            ConnectorState::Connecting | ConnectorState::Reconnecting
                        ) {
                            break current;
                        }
                        if state.changed().await.is_err() {
                            return Err(GatewayError::Cancelled("connector dropped".into()));
                        }
                    };
                    match settled {
                        ConnectorState::Disconnected => continue,
                        _ => {
                            return self
                                .inner
                                .lifecycle
                                .ensure_connected()
                                .map(|_| ConnectorState::Connected)
                        }
                    }
                }
            }
        }

        info!(connector = %self.inner.name, "Connecting");
        match self.inner.open_session().await {
            Ok(()) => {
                if self.inner.lifecycle.connected() {
                    self.inner.resubscribe().await;
                    Ok(ConnectorState::Connected)
                } else {
                    // Disconnected while the transport was opening.
                    self.inner.teardown().await;
                    Err(GatewayError::Cancelled("disconnected while connecting".into()))
                }
            }
            Err(error) => {
                self.inner.lifecycle.connect_failed(error.clone());
                Err(error.into())
            }
        }
    }

    /// Drop the connection. Always succeeds locally: reconnects stop, the
    /// transport is released and every pending handle resolves `Cancelled`.
    pub async fn disconnect(&self) {
        if let Some(reconnect) = self
            .inner
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reconnect.abort();
        }
        self.inner.lifecycle.disconnected();
        self.inner.tracker.cancel_pending("connector disconnected");
        self.inner.teardown().await;
    }

    // -----------------------------------------------------------------------
    // Account & positions
    // -----------------------------------------------------------------------

    /// Pull the account from the venue and return the reconciled view of it.
    pub async fn get_account(&self) -> Result<Account, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        let account = self.inner.pull(self.inner.adapter.fetch_account()).await?;
        self.inner.reconciler.apply_account(account.clone());
        Ok(self.inner.reconciler.account().unwrap_or(account))
    }

    /// Pull positions from the venue and return the reconciled set.
    pub async fn get_positions(&self) -> Result<Vec<Position>, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        self.inner.pull_positions().await?;
        Ok(self.inner.reconciler.positions())
    }

    /// Reconciled account and positions without a venue round trip.
    pub fn snapshot(&self) -> ReconciledView {
        self.inner.reconciler.snapshot()
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    /// Submit an order. Returns as soon as the order is tracked; the handle
    /// resolves on acknowledgement, rejection, timeout or cancellation.
    pub fn place_order(&self, request: OrderRequest) -> Result<OrderHandle, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        request.validate()?;

        let (order, handle) = self.inner.tracker.register(&request);
        let cid = order.correlation_id;
        info!(
            connector = %self.inner.name,
            correlation_id = %cid,
            symbol = %request.symbol,
            side = ?request.side,
            quantity = %request.quantity,
            "Placing order"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner
                .until_closed(inner.adapter.submit_order(cid, &request))
                .await
            {
                Some(Err(error)) => inner.tracker.submission_failed(cid, &error),
                Some(Ok(())) => debug!(connector = %inner.name, correlation_id = %cid, "Order sent"),
                None => debug!(connector = %inner.name, correlation_id = %cid, "Connection closed while sending order"),
            }
        });
        self.inner.expire_after(self.inner.config.ack_timeout(), move |tracker| {
            tracker.expire_unacked(cid);
        });
        Ok(handle)
    }

    /// Ask the venue to change a working order.
    pub fn modify_order(
        &self,
        correlation_id: CorrelationId,
        amendment: OrderAmendment,
    ) -> Result<ActionHandle, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        amendment.validate()?;
        let (venue_id, action_id, handle) = self
            .inner
            .tracker
            .begin_action(correlation_id, ActionKind::Amend)?;
        info!(connector = %self.inner.name, correlation_id = %correlation_id, venue_id = %venue_id, "Modifying order");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Some(Err(error)) = inner
                .until_closed(inner.adapter.amend_order(&venue_id, &amendment))
                .await
            {
                inner.tracker.action_failed(correlation_id, action_id, error);
            }
        });
        self.inner.expire_after(self.inner.config.ack_timeout(), move |tracker| {
            tracker.expire_action(correlation_id, action_id);
        });
        Ok(handle)
    }

    /// Ask the venue to cancel a working order. The handle resolves once the
    /// order is confirmed `Cancelled`.
    pub fn cancel_order(&self, correlation_id: CorrelationId) -> Result<ActionHandle, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        let (venue_id, action_id, handle) = self
            .inner
            .tracker
            .begin_action(correlation_id, ActionKind::Cancel)?;
        info!(connector = %self.inner.name, correlation_id = %correlation_id, venue_id = %venue_id, "Cancelling order");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Some(Err(error)) = inner
                .until_closed(inner.adapter.cancel_order(&venue_id))
                .await
            {
                inner.tracker.action_failed(correlation_id, action_id, error);
            }
        });
        self.inner.expire_after(self.inner.config.ack_timeout(), move |tracker| {
            tracker.expire_action(correlation_id, action_id);
        });
        Ok(handle)
    }

    /// Pull working orders from the venue. Orders the gateway did not issue
    /// are adopted so they can be managed like any other.
    pub async fn get_open_orders(&self) -> Result<Vec<Order>, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        let venue_orders = self.inner.pull(self.inner.adapter.fetch_open_orders()).await?;
        for venue_order in venue_orders.iter().filter(|o| !o.status.is_terminal()) {
            self.inner.tracker.adopt(venue_order);
        }
        Ok(self.inner.tracker.open_orders())
    }

    /// Look up one order by correlation id or venue id.
    pub async fn get_order(&self, id: &OrderRef) -> Result<Order, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        match id {
            OrderRef::Correlation(cid) => self
                .inner
                .tracker
                .get(*cid)
                .ok_or_else(|| GatewayError::NotFound(format!("order {cid}"))),
            OrderRef::Venue(venue_id) => {
                if let Some(order) = self.inner.tracker.find_by_venue_id(venue_id) {
                    return Ok(order);
                }
                match self.inner.pull(self.inner.adapter.fetch_order(venue_id)).await? {
                    Some(venue_order) => Ok(self.inner.tracker.adopt(&venue_order)),
                    None => Err(GatewayError::NotFound(format!("venue order {venue_id}"))),
                }
            }
        }
    }

    /// Flatten the position in `symbol` with an offsetting market order that
    /// goes through the normal order lifecycle.
    pub async fn close_position(&self, symbol: &str) -> Result<OrderHandle, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        let position = match self.inner.reconciler.position(symbol) {
            Some(position) => Some(position),
            None => {
                self.inner.pull_positions().await?;
                self.inner.reconciler.position(symbol)
            }
        };
        let position = position
            .filter(|p| !p.is_flat())
            .ok_or_else(|| GatewayError::NotFound(format!("open position in {symbol}")))?;

        info!(
            connector = %self.inner.name,
            symbol,
            net_quantity = %position.net_quantity,
            "Closing position"
        );
        self.place_order(OrderRequest::market(
            symbol,
            position.closing_side(),
            position.net_quantity.abs(),
        ))
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register `listener` for quotes on `symbols`. The venue is only asked
    /// to subscribe symbols no other listener already holds.
    pub async fn subscribe_to_market_data(
        &self,
        symbols: &[String],
        listener: Arc<dyn MarketDataListener>,
    ) -> Result<MarketDataSubscription, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        if symbols.is_empty() || symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(GatewayError::Validation(
                "market data subscription needs non-empty symbols".into(),
            ));
        }

        let _guards = self.inner.lock_symbols(symbols).await;
        let HubSubscription {
            subscription,
            newly_active,
        } = self.inner.hub.subscribe(symbols, listener)?;

        for (i, symbol) in newly_active.iter().enumerate() {
            if let Err(error) = self.inner.pull(self.inner.adapter.subscribe(symbol)).await {
                warn!(connector = %self.inner.name, symbol = %symbol, error = %error, "Venue subscribe failed, rolling back");
                let vacated = self.inner.hub.unsubscribe(subscription.id);
                for done in vacated.iter().filter(|s| newly_active[..i].contains(s)) {
                    if let Err(e) = self.inner.adapter.unsubscribe(done).await {
                        debug!(connector = %self.inner.name, symbol = %done, error = %e, "Rollback unsubscribe failed");
                    }
                }
                return Err(error);
            }
            debug!(connector = %self.inner.name, symbol = %symbol, "Venue subscription opened");
        }
        Ok(subscription)
    }

    /// Remove a market data subscription. Local bookkeeping is always
    /// released; the venue is unsubscribed from symbols nobody wants any
    /// more if the connector is connected.
    pub async fn unsubscribe_from_market_data(&self, subscription: &MarketDataSubscription) {
        let _guards = self.inner.lock_symbols(&subscription.symbols).await;
        let vacated = self.inner.hub.unsubscribe(subscription.id);
        if !self.inner.lifecycle.is_connected() {
            return;
        }
        for symbol in vacated {
            if let Err(error) = self.inner.adapter.unsubscribe(&symbol).await {
                warn!(connector = %self.inner.name, symbol = %symbol, error = %error, "Venue unsubscribe failed");
            }
        }
    }

    /// Register a listener for order state transitions.
    pub fn subscribe_to_order_updates(
        &self,
        listener: Arc<dyn OrderUpdateListener>,
    ) -> Result<u64, GatewayError> {
        self.inner.lifecycle.ensure_connected()?;
        Ok(self.inner.tracker.subscribe(listener))
    }

    pub fn unsubscribe_from_order_updates(&self, id: u64) -> bool {
        self.inner.tracker.unsubscribe(id)
    }
}

// ---------------------------------------------------------------------------
// Session internals
// ---------------------------------------------------------------------------

/// Resolves once the state leaves `Connected`.
async fn connection_closed(mut state: watch::Receiver<ConnectorState>) {
    while *state.borrow_and_update() == ConnectorState::Connected {
        if state.changed().await.is_err() {
            return;
        }
    }
}

impl Inner {
    /// Run a venue call, abandoning it if the connection goes away first.
    async fn until_closed<F: Future>(&self, call: F) -> Option<F::Output> {
        tokio::select! {
            output = call => Some(output),
            _ = connection_closed(self.lifecycle.watch()) => None,
        }
    }

    async fn pull<T, F>(&self, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, VenueError>>,
    {
        match self.until_closed(call).await {
            Some(result) => result.map_err(GatewayError::from),
            None => Err(GatewayError::Cancelled(
                "connection closed while waiting on the venue".into(),
            )),
        }
    }

    async fn pull_positions(&self) -> Result<(), GatewayError> {
        let as_of = Utc::now();
        let positions = self.pull(self.adapter.fetch_positions()).await?;
        self.reconciler.apply_snapshot(positions, as_of);
        Ok(())
    }

    async fn reconcile_once(&self) {
        match self.pull(self.adapter.fetch_account()).await {
            Ok(account) => {
                self.reconciler.apply_account(account);
            }
            Err(error) => debug!(connector = %self.name, error = %error, "Account pull failed"),
        }
        if let Err(error) = self.pull_positions().await {
            debug!(connector = %self.name, error = %error, "Position pull failed");
        }
    }

    /// Run `f` against the tracker after `delay`, unless the connector is
    /// gone by then.
    fn expire_after<F>(self: &Arc<Self>, delay: Duration, f: F)
    where
        F: FnOnce(&OrderTracker) + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                f(&inner.tracker);
            }
        });
    }

    /// Open the venue transport and start the session tasks.
    async fn open_session(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let (sink, rx) = mpsc::unbounded_channel();
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.adapter.open(sink)).await {
            Err(_) => {
                self.adapter.close().await;
                return Err(ConnectionError::Timeout(timeout));
            }
            Ok(Err(error)) => return Err(error.into_connection_error(timeout)),
            Ok(Ok(())) => {}
        }

        let weak = Arc::downgrade(self);
        let session = Session {
            ingest: tokio::spawn(ingest(weak.clone(), rx)),
            supervisor: tokio::spawn(supervise(
                weak,
                self.config.heartbeat_interval(),
                self.config.reconcile_interval(),
            )),
        };
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session);
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    fn stop_session(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.stop();
        }
    }

    async fn teardown(&self) {
        self.stop_session();
        self.adapter.close().await;
    }

    /// Re-issue venue subscriptions for every symbol that still has listeners.
    async fn resubscribe(&self) {
        for symbol in self.hub.active_symbols() {
            let _guard = self.lock_symbols(std::slice::from_ref(&symbol)).await;
            if self.hub.listener_count(&symbol) == 0 {
                continue;
            }
            if let Err(error) = self.adapter.subscribe(&symbol).await {
                warn!(connector = %self.name, symbol = %symbol, error = %error, "Resubscribe failed");
            }
        }
    }

    /// Take the per-symbol locks for `symbols`, in sorted order.
    async fn lock_symbols(&self, symbols: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut ordered: Vec<&String> = symbols.iter().collect();
        ordered.sort();
        ordered.dedup();
        let mut guards = Vec::with_capacity(ordered.len());
        for symbol in ordered {
            let lock = self.symbol_locks.entry(symbol.clone()).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    fn transport_lost(self: &Arc<Self>, reason: &str) {
        if !self.lifecycle.transport_lost(reason) {
            return;
        }
        let handle = tokio::spawn(reconnect(Arc::downgrade(self)));
        let previous = self
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

/// Route venue push traffic to the tracker, the hub and the reconciler.
async fn ingest(weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<VenueEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            VenueEvent::Quote(quote) => {
                inner.reconciler.mark(&quote);
                inner.hub.publish(MarketDataEvent::Quote {
                    connector: inner.name.clone(),
                    quote,
                });
            }
            VenueEvent::Account(account) => {
                inner.reconciler.apply_account(account);
            }
            VenueEvent::Position(position) => {
                inner.reconciler.apply_position(position);
            }
            VenueEvent::TransportLost { reason } => {
                inner.transport_lost(&reason);
                return;
            }
            order_event => {
                if let Some(fill) = inner.tracker.apply(order_event) {
                    inner.reconciler.apply_fill(&fill);
                }
            }
        }
    }
}

/// Health checks and periodic reconciliation while connected.
async fn supervise(weak: Weak<Inner>, heartbeat: Duration, reconcile: Duration) {
    let Some(mut state) = weak.upgrade().map(|inner| inner.lifecycle.watch()) else {
        return;
    };
    loop {
        let current = *state.borrow_and_update();
        match current {
            ConnectorState::Connected => break,
            ConnectorState::Connecting | ConnectorState::Reconnecting => {
                if state.changed().await.is_err() {
                    return;
                }
            }
            _ => return,
        }
    }

    let mut heartbeat_tick = interval_at(Instant::now() + heartbeat, heartbeat);
    heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reconcile_tick = interval(reconcile);
    reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat_tick.tick() => {
                let Some(inner) = weak.upgrade() else { return };
                if !inner.lifecycle.is_connected() {
                    return;
                }
                if let Err(error) = inner.adapter.heartbeat().await {
                    warn!(connector = %inner.name, error = %error, "Heartbeat failed");
                    inner.transport_lost(&format!("heartbeat failed: {error}"));
                    return;
                }
            }
            _ = reconcile_tick.tick() => {
                let Some(inner) = weak.upgrade() else { return };
                if !inner.lifecycle.is_connected() {
                    return;
                }
                inner.reconcile_once().await;
            }
        }
    }
}

/// Reconnect with exponential backoff until connected, exhausted, or
/// superseded by an explicit disconnect.
async fn reconnect(weak: Weak<Inner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    inner.teardown().await;

    let attempts = inner.lifecycle.max_attempts();
    let mut last_error = "transport lost".to_string();
    for attempt in 1..=attempts {
        let delay = inner.lifecycle.delay_for(attempt);
        inner.lifecycle.reconnect_scheduled(attempt, delay);
        tokio::time::sleep(delay).await;
        if inner.lifecycle.state() != ConnectorState::Reconnecting {
            return;
        }
        match inner.open_session().await {
            Ok(()) => {
                if inner.lifecycle.connected() {
                    info!(connector = %inner.name, attempt, "Reconnected");
                    inner.resubscribe().await;
                } else {
                    inner.teardown().await;
                }
                return;
            }
            Err(error) => {
                warn!(connector = %inner.name, attempt, error = %error, "Reconnect attempt failed");
                last_error = error.to_string();
            }
        }
    }

    if inner.lifecycle.reconnect_exhausted(attempts, last_error) {
        inner.tracker.cancel_pending("connector failed after reconnect attempts");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_brokers_common::{SimulatedVenue, SimulatedVenueConfig};
    use rust_decimal_macros::dec;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> ConnectorConfig {
        ConnectorConfig {
            ack_timeout_ms: 2_000,
            connect_timeout_ms: 1_000,
            backoff: crate::config::BackoffConfig {
                initial_delay_ms: 10,
                max_delay_ms: 50,
                multiplier: 2.0,
                max_attempts: 3,
            },
            ..ConnectorConfig::default()
        }
    }

    fn setup(config: ConnectorConfig) -> (Arc<SimulatedVenue>, Connector) {
        let venue = Arc::new(SimulatedVenue::new(SimulatedVenueConfig::default()));
        let connector = Connector::new(venue.clone(), config);
        (venue, connector)
    }

    async fn connected() -> (Arc<SimulatedVenue>, Connector) {
        let (venue, connector) = setup(fast_config());
        connector.connect().await.unwrap();
        (venue, connector)
    }

    /// Poll `check` until it holds or the test deadline passes.
    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    async fn wait_for_state(connector: &Connector, target: ConnectorState) {
        let mut state = connector.watch_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == target))
            .await
            .expect("state never reached")
            .unwrap();
    }

    /// Simulated venue whose subscription calls take a while and can be
    /// told to fail once.
    struct SlowFeed {
        venue: SimulatedVenue,
        delay: Duration,
        refuse_next: std::sync::atomic::AtomicBool,
    }

    impl SlowFeed {
        fn new(delay: Duration) -> Self {
            Self {
                venue: SimulatedVenue::new(SimulatedVenueConfig::default()),
                delay,
                refuse_next: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn refuse_next_subscribe(&self) {
            self.refuse_next
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl VenueAdapter for SlowFeed {
        fn name(&self) -> &str {
            self.venue.name()
        }

        async fn open(&self, sink: VenueSink) -> Result<(), VenueError> {
            self.venue.open(sink).await
        }

        async fn close(&self) {
            self.venue.close().await
        }

        async fn heartbeat(&self) -> Result<(), VenueError> {
            self.venue.heartbeat().await
        }

        async fn fetch_account(&self) -> Result<Account, VenueError> {
            self.venue.fetch_account().await
        }

        async fn fetch_positions(&self) -> Result<Vec<Position>, VenueError> {
            self.venue.fetch_positions().await
        }

        async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
            self.venue.fetch_open_orders().await
        }

        async fn fetch_order(&self, venue_id: &str) -> Result<Option<VenueOrder>, VenueError> {
            self.venue.fetch_order(venue_id).await
        }

        async fn submit_order(
            &self,
            correlation_id: CorrelationId,
            request: &OrderRequest,
        ) -> Result<(), VenueError> {
            self.venue.submit_order(correlation_id, request).await
        }

        async fn amend_order(&self, venue_id: &str, amendment: &OrderAmendment) -> Result<(), VenueError> {
            self.venue.amend_order(venue_id, amendment).await
        }

        async fn cancel_order(&self, venue_id: &str) -> Result<(), VenueError> {
            self.venue.cancel_order(venue_id).await
        }

        async fn subscribe(&self, symbol: &str) -> Result<(), VenueError> {
            tokio::time::sleep(self.delay).await;
            if self
                .refuse_next
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(VenueError::Rejected(format!("subscription to {symbol} refused")));
            }
            self.venue.subscribe(symbol).await
        }

        async fn unsubscribe(&self, symbol: &str) -> Result<(), VenueError> {
            tokio::time::sleep(self.delay).await;
            self.venue.unsubscribe(symbol).await
        }
    }

    struct Collect<T>(mpsc::UnboundedSender<T>);

    #[async_trait]
    impl OrderUpdateListener for Collect<OrderUpdate> {
        async fn on_order_update(&self, update: &OrderUpdate) -> Result<(), ListenerError> {
            let _ = self.0.send(update.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl MarketDataListener for Collect<MarketDataEvent> {
        async fn on_market_data(&self, event: &MarketDataEvent) -> Result<(), ListenerError> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    fn order_collector() -> (Arc<dyn OrderUpdateListener>, mpsc::UnboundedReceiver<OrderUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collect(tx)), rx)
    }

    fn quote_collector() -> (Arc<dyn MarketDataListener>, mpsc::UnboundedReceiver<MarketDataEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collect(tx)), rx)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("nothing delivered")
            .expect("channel closed")
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_order_rejected_while_disconnected() {
        let (venue, connector) = setup(fast_config());

        let err = connector
            .place_order(OrderRequest::market("EURUSD", Side::Buy, dec!(1000)))
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::NotConnected {
                state: ConnectorState::Disconnected
            }
        );

        connector.connect().await.unwrap();
        assert!(connector.get_open_orders().await.unwrap().is_empty());
        assert_eq!(venue.open_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (venue, connector) = setup(fast_config());
        let (a, b) = tokio::join!(connector.connect(), connector.connect());
        assert_eq!(a.unwrap(), ConnectorState::Connected);
        assert_eq!(b.unwrap(), ConnectorState::Connected);
        connector.connect().await.unwrap();
        assert_eq!(venue.open_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_failed() {
        let (venue, connector) = setup(fast_config());
        venue.fail_next_opens(1);

        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(ConnectionError::Network(_))));
        assert_eq!(connector.state(), ConnectorState::Failed);
        assert!(connector.failure().is_some());

        connector.connect().await.unwrap();
        assert!(connector.is_connected());
        assert!(connector.failure().is_none());
    }

    #[tokio::test]
    async fn test_ack_partial_fill_fill_updates() {
        let (venue, connector) = connected().await;
        let (listener, mut updates) = order_collector();
        connector.subscribe_to_order_updates(listener).unwrap();

        let order = connector
            .place_order(OrderRequest::limit("EURUSD", Side::Buy, dec!(100), dec!(1.0500)))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Acknowledged);
        let venue_id = order.venue_id.clone().unwrap();

        assert!(venue.fill(&venue_id, dec!(40), dec!(1.0500)));
        assert!(venue.fill(&venue_id, dec!(60), dec!(1.0500)));

        let first = next(&mut updates).await;
        assert_eq!(first.previous, OrderStatus::Submitted);
        assert_eq!(first.order.status, OrderStatus::Acknowledged);

        let second = next(&mut updates).await;
        assert_eq!(second.order.status, OrderStatus::PartiallyFilled);
        assert_eq!(second.order.filled_quantity, dec!(40));
        assert_eq!(second.fill.as_ref().unwrap().quantity, dec!(40));

        let third = next(&mut updates).await;
        assert_eq!(third.previous, OrderStatus::PartiallyFilled);
        assert_eq!(third.order.status, OrderStatus::Filled);
        assert_eq!(third.order.filled_quantity, dec!(100));
        assert_eq!(third.order.correlation_id, order.correlation_id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updates.try_recv().is_err());

        eventually(|| {
            connector
                .snapshot()
                .positions
                .iter()
                .any(|p| p.symbol == "EURUSD" && p.net_quantity == dec!(100))
        })
        .await;
    }

    #[tokio::test]
    async fn test_venue_rejection_resolves_handle() {
        let (venue, connector) = connected().await;
        venue.reject_next_submit("insufficient margin");

        let handle = connector
            .place_order(OrderRequest::market("EURUSD", Side::Buy, dec!(1000)))
            .unwrap();
        let cid = handle.correlation_id();
        match handle.await {
            Err(GatewayError::OrderRejected {
                correlation_id,
                reason,
            }) => {
                assert_eq!(correlation_id, cid);
                assert!(reason.contains("insufficient margin"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let order = connector.get_order(&OrderRef::Correlation(cid)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_missing_ack_times_out_and_late_ack_is_ignored() {
        let (venue, connector) = setup(ConnectorConfig {
            ack_timeout_ms: 50,
            ..fast_config()
        });
        connector.connect().await.unwrap();
        venue.set_auto_ack(false);

        let handle = connector
            .place_order(OrderRequest::limit("EURUSD", Side::Sell, dec!(10), dec!(1.2)))
            .unwrap();
        let cid = handle.correlation_id();
        assert!(matches!(handle.await, Err(GatewayError::Timeout { .. })));

        assert!(venue.acknowledge(cid).is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let order = connector.get_order(&OrderRef::Correlation(cid)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.reject_cause, Some(RejectCause::Timeout));
        assert!(order.venue_id.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_handles() {
        let (venue, connector) = connected().await;
        venue.set_auto_ack(false);

        let handle = connector
            .place_order(OrderRequest::market("EURUSD", Side::Buy, dec!(5)))
            .unwrap();
        connector.disconnect().await;

        assert!(matches!(handle.await, Err(GatewayError::Cancelled(_))));
        assert_eq!(connector.state(), ConnectorState::Disconnected);
        assert!(!venue.is_open());
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_fails_pending_orders() {
        let (venue, connector) = connected().await;
        venue.set_auto_ack(false);
        let handle = connector
            .place_order(OrderRequest::market("EURUSD", Side::Buy, dec!(5)))
            .unwrap();

        venue.fail_next_opens(10);
        venue.drop_transport("cable pulled");

        wait_for_state(&connector, ConnectorState::Failed).await;
        assert!(matches!(
            connector.failure(),
            Some(ConnectionError::RetriesExhausted { attempts: 3, .. })
        ));
        let resolved = tokio::time::timeout(WAIT, handle).await.unwrap();
        assert!(matches!(resolved, Err(GatewayError::Cancelled(_))));

        // 1 initial open + 3 reconnect attempts
        assert_eq!(venue.open_count(), 4);
        // A failed connector reports why, not just that it is down.
        assert!(matches!(
            connector.place_order(OrderRequest::market("EURUSD", Side::Buy, dec!(1))),
            Err(GatewayError::Connection(ConnectionError::RetriesExhausted { attempts: 3, .. }))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_restores_market_data() {
        let (venue, connector) = connected().await;
        let (listener, mut quotes) = quote_collector();
        connector
            .subscribe_to_market_data(&symbols(&["EURUSD"]), listener)
            .await
            .unwrap();
        assert_eq!(venue.subscribe_count("EURUSD"), 1);

        let mut events = connector.events();
        venue.drop_transport("reset by peer");
        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let GatewayEvent::StateChanged {
                from: ConnectorState::Reconnecting,
                to: ConnectorState::Connected,
                ..
            } = event
            {
                break;
            }
        }
        eventually(|| venue.is_subscribed("EURUSD")).await;
        assert_eq!(venue.subscribe_count("EURUSD"), 2);

        venue.set_quote("EURUSD", dec!(1.1000), dec!(1.1002));
        let MarketDataEvent::Quote { quote, .. } = next(&mut quotes).await;
        assert_eq!(quote.symbol, "EURUSD");
        assert_eq!(quote.ask, dec!(1.1002));
    }

    #[tokio::test]
    async fn test_shared_symbol_uses_one_venue_subscription() {
        let (venue, connector) = connected().await;
        let mut receivers = Vec::new();
        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            let (listener, rx) = quote_collector();
            receivers.push(rx);
            subscriptions.push(
                connector
                    .subscribe_to_market_data(&symbols(&["XAUUSD"]), listener)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(venue.subscribe_count("XAUUSD"), 1);

        venue.set_quote("XAUUSD", dec!(2400.10), dec!(2400.40));
        for rx in receivers.iter_mut() {
            let event = next(rx).await;
            assert_eq!(event.symbol(), "XAUUSD");
        }

        connector.unsubscribe_from_market_data(&subscriptions[0]).await;
        connector.unsubscribe_from_market_data(&subscriptions[1]).await;
        assert!(venue.is_subscribed("XAUUSD"));
        assert!(!subscriptions[0].is_live());

        connector.unsubscribe_from_market_data(&subscriptions[2]).await;
        assert!(!venue.is_subscribed("XAUUSD"));
    }

    #[tokio::test]
    async fn test_unsubscribe_racing_subscribe_keeps_feed() {
        let feed = Arc::new(SlowFeed::new(Duration::from_millis(50)));
        let connector = Connector::new(feed.clone(), fast_config());
        connector.connect().await.unwrap();

        let (first, _first_rx) = quote_collector();
        let leaving = connector
            .subscribe_to_market_data(&symbols(&["EURUSD"]), first)
            .await
            .unwrap();

        let unsubscribe = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.unsubscribe_from_market_data(&leaving).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (second, mut quotes) = quote_collector();
        let staying = connector
            .subscribe_to_market_data(&symbols(&["EURUSD"]), second)
            .await
            .unwrap();
        unsubscribe.await.unwrap();

        assert!(staying.is_live());
        assert!(feed.venue.is_subscribed("EURUSD"));
        feed.venue.set_quote("EURUSD", dec!(1.1000), dec!(1.1002));
        assert_eq!(next(&mut quotes).await.symbol(), "EURUSD");
    }

    #[tokio::test]
    async fn test_failed_first_subscribe_hands_symbol_to_next_listener() {
        let feed = Arc::new(SlowFeed::new(Duration::from_millis(50)));
        let connector = Connector::new(feed.clone(), fast_config());
        connector.connect().await.unwrap();
        feed.refuse_next_subscribe();

        let (first, _first_rx) = quote_collector();
        let refused = {
            let connector = connector.clone();
            tokio::spawn(async move {
                connector
                    .subscribe_to_market_data(&symbols(&["EURUSD"]), first)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (second, mut quotes) = quote_collector();
        let accepted = connector
            .subscribe_to_market_data(&symbols(&["EURUSD"]), second)
            .await;

        assert!(refused.await.unwrap().is_err());
        assert!(accepted.unwrap().is_live());
        assert!(feed.venue.is_subscribed("EURUSD"));
        feed.venue.set_quote("EURUSD", dec!(1.1000), dec!(1.1002));
        assert_eq!(next(&mut quotes).await.symbol(), "EURUSD");
    }

    #[tokio::test]
    async fn test_heartbeat_failure_triggers_reconnect() {
        let (venue, connector) = setup(ConnectorConfig {
            heartbeat_interval_secs: 1,
            ..fast_config()
        });
        connector.connect().await.unwrap();
        let mut events = connector.events();

        venue.set_heartbeat_failing(true);
        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let GatewayEvent::StateChanged {
                from: ConnectorState::Connected,
                to: ConnectorState::Reconnecting,
                ..
            } = event
            {
                break;
            }
        }
        venue.set_heartbeat_failing(false);

        wait_for_state(&connector, ConnectorState::Connected).await;
        assert!(venue.open_count() >= 2);
    }

    #[tokio::test]
    async fn test_periodic_reconcile_picks_up_venue_positions() {
        let (venue, connector) = setup(ConnectorConfig {
            reconcile_interval_secs: 1,
            ..fast_config()
        });
        connector.connect().await.unwrap();
        assert!(connector.snapshot().positions.is_empty());

        venue.set_position(Position {
            symbol: "USDJPY".into(),
            net_quantity: dec!(-500),
            avg_price: dec!(151.20),
            unrealized_pnl: dec!(0),
            updated_at: Utc::now(),
        });

        eventually(|| {
            connector
                .snapshot()
                .positions
                .iter()
                .any(|p| p.symbol == "USDJPY" && p.net_quantity == dec!(-500))
        })
        .await;
    }

    #[tokio::test]
    async fn test_repeated_venue_push_notifies_once() {
        let (venue, connector) = connected().await;
        let (listener, mut updates) = order_collector();
        connector.subscribe_to_order_updates(listener).unwrap();

        let order = connector
            .place_order(OrderRequest::limit("EURUSD", Side::Buy, dec!(100), dec!(1.0500)))
            .unwrap()
            .await
            .unwrap();
        let fill = VenueEvent::Filled {
            order: OrderRef::Venue(order.venue_id.clone().unwrap()),
            quantity: dec!(10),
            price: dec!(1.0500),
            seq: 9_000,
            timestamp: Utc::now(),
        };
        assert!(venue.inject(fill.clone()));
        assert!(venue.inject(fill));

        assert_eq!(next(&mut updates).await.order.status, OrderStatus::Acknowledged);
        let filled = next(&mut updates).await;
        assert_eq!(filled.order.status, OrderStatus::PartiallyFilled);
        assert_eq!(filled.order.filled_quantity, dec!(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updates.try_recv().is_err());
        assert_eq!(
            connector
                .get_order(&OrderRef::Correlation(order.correlation_id))
                .await
                .unwrap()
                .filled_quantity,
            dec!(10)
        );
    }

    #[tokio::test]
    async fn test_empty_symbol_list_is_refused() {
        let (_venue, connector) = connected().await;
        let (listener, _rx) = quote_collector();
        let err = connector
            .subscribe_to_market_data(&[], listener)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_external_orders_are_adopted() {
        let (venue, connector) = connected().await;
        let venue_id = venue.place_external_order("GBPUSD", Side::Sell, dec!(10), dec!(1.3000));

        let open = connector.get_open_orders().await.unwrap();
        assert_eq!(open.len(), 1);
        let adopted = &open[0];
        assert_eq!(adopted.venue_id.as_deref(), Some(venue_id.as_str()));
        assert_eq!(adopted.status, OrderStatus::Acknowledged);

        let again = connector.get_order(&OrderRef::Venue(venue_id)).await.unwrap();
        assert_eq!(again.correlation_id, adopted.correlation_id);

        let cancelled = connector
            .cancel_order(adopted.correlation_id)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(connector.get_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_modify_working_order() {
        let (_venue, connector) = connected().await;
        let order = connector
            .place_order(OrderRequest::limit("EURUSD", Side::Buy, dec!(100), dec!(1.0400)))
            .unwrap()
            .await
            .unwrap();

        let amended = connector
            .modify_order(
                order.correlation_id,
                OrderAmendment {
                    quantity: Some(dec!(150)),
                    price: None,
                },
            )
            .unwrap()
            .await
            .unwrap();
        assert_eq!(amended.quantity, dec!(150));
        assert_eq!(amended.status, OrderStatus::Acknowledged);
    }

    #[tokio::test]
    async fn test_unknown_orders_are_not_found() {
        let (_venue, connector) = connected().await;
        assert!(matches!(
            connector.get_order(&OrderRef::Venue("SIM-999".into())).await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            connector
                .get_order(&OrderRef::Correlation(CorrelationId::next()))
                .await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            connector.cancel_order(CorrelationId::next()),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_position_flattens() {
        let (venue, connector) = connected().await;
        venue.set_quote("EURUSD", dec!(1.1000), dec!(1.1002));
        connector
            .place_order(OrderRequest::market("EURUSD", Side::Buy, dec!(1000)))
            .unwrap()
            .await
            .unwrap();

        let positions = connector.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_quantity, dec!(1000));

        let closing = connector.close_position("EURUSD").await.unwrap().await.unwrap();
        assert_eq!(closing.side, Side::Sell);
        assert_eq!(closing.quantity, dec!(1000));

        eventually(|| connector.snapshot().positions.iter().all(|p| p.is_flat())).await;
        assert!(matches!(
            connector.close_position("EURUSD").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_account_reflects_venue() {
        let (_venue, connector) = connected().await;
        let account = connector.get_account().await.unwrap();
        assert_eq!(account.id, "SIM-001");
        assert_eq!(account.balance, dec!(50000));
        assert_eq!(connector.snapshot().account.unwrap().id, "SIM-001");
    }

    #[tokio::test]
    async fn test_order_updates_need_connection() {
        let (_venue, connector) = setup(fast_config());
        let (listener, _rx) = order_collector();
        assert!(connector.subscribe_to_order_updates(listener).is_err());
    }
}
