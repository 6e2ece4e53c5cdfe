//! Venue-agnostic connector core.
//!
//! A [`Connector`] wraps one [`VenueAdapter`](gateway_core::VenueAdapter)
//! and layers the shared gateway behaviour on top of it: connection
//! lifecycle with reconnect, order correlation, market data fan-out and
//! account/position reconciliation.

pub mod config;
pub mod connector;
mod dispatch;
pub mod handle;
pub mod hub;
pub mod lifecycle;
pub mod reconciler;
pub mod tracker;

pub use config::{BackoffConfig, ConnectorConfig};
pub use connector::Connector;
pub use handle::{ActionHandle, ActionKind, OrderHandle};
pub use hub::{FanOutHub, HubSubscription};
pub use lifecycle::{ConnectStart, Lifecycle};
pub use reconciler::{ReconciledView, Reconciler};
pub use tracker::{FillDelta, OrderTracker};
