use crate::error::*;
use crate::events::*;
use crate::models::*;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Venue Adapter Trait
// ---------------------------------------------------------------------------

/// The venue-specific half of a connector.
///
/// An adapter owns one venue's wire protocol and nothing else: connection
/// state, order correlation, subscription bookkeeping and reconciliation
/// all live in the connector core, which drives the adapter through this
/// trait. Push traffic goes into the [`VenueSink`] given to [`open`].
///
/// [`open`]: VenueAdapter::open
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Static identity of the venue (e.g. "MetaTrader", "OANDA").
    fn name(&self) -> &str;

    /// Open the transport and authenticate. Push events for the session
    /// are sent to `sink` until [`close`](VenueAdapter::close) is called or
    /// the transport drops, in which case the adapter sends
    /// [`VenueEvent::TransportLost`].
    async fn open(&self, sink: VenueSink) -> Result<(), VenueError>;

    /// Release the transport. Must be safe to call when already closed.
    async fn close(&self);

    /// Cheap liveness probe used by the health check.
    async fn heartbeat(&self) -> Result<(), VenueError>;

    async fn fetch_account(&self) -> Result<Account, VenueError>;

    async fn fetch_positions(&self) -> Result<Vec<Position>, VenueError>;

    async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError>;

    async fn fetch_order(&self, venue_id: &str) -> Result<Option<VenueOrder>, VenueError>;

    /// Send a new order tagged with its correlation id. Acceptance is
    /// reported later as [`VenueEvent::Accepted`].
    async fn submit_order(
        &self,
        correlation_id: CorrelationId,
        request: &OrderRequest,
    ) -> Result<(), VenueError>;

    async fn amend_order(&self, venue_id: &str, amendment: &OrderAmendment) -> Result<(), VenueError>;

    async fn cancel_order(&self, venue_id: &str) -> Result<(), VenueError>;

    /// Start the venue-level market data feed for one symbol.
    async fn subscribe(&self, symbol: &str) -> Result<(), VenueError>;

    async fn unsubscribe(&self, symbol: &str) -> Result<(), VenueError>;
}

// ---------------------------------------------------------------------------
// Listener Traits
// ---------------------------------------------------------------------------

/// Receives quotes for the symbols it subscribed to.
#[async_trait]
pub trait MarketDataListener: Send + Sync {
    /// Name used in logs when the listener fails.
    fn name(&self) -> &str {
        "market-data-listener"
    }

    async fn on_market_data(&self, event: &MarketDataEvent) -> Result<(), ListenerError>;
}

/// Receives order state transitions, in order, per order.
#[async_trait]
pub trait OrderUpdateListener: Send + Sync {
    fn name(&self) -> &str {
        "order-update-listener"
    }

    async fn on_order_update(&self, update: &OrderUpdate) -> Result<(), ListenerError>;
}
