//! Per-listener delivery tasks.
//!
//! Each listener gets its own queue and its own task, so a slow or failing
//! listener only ever delays itself. Producers push into the queue without
//! waiting; events for a listener are delivered in the order they were queued.

use futures_util::FutureExt;
use gateway_core::*;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn report_failure(
    events: &broadcast::Sender<GatewayEvent>,
    connector: &str,
    listener: &str,
    error: String,
) {
    warn!(connector, listener, error = %error, "Listener failed, continuing");
    let _ = events.send(GatewayEvent::ListenerFailed {
        connector: connector.to_string(),
        listener: listener.to_string(),
        error,
    });
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "listener panicked".to_string())
}

/// Drive a market data listener from a bounded queue.
pub(crate) fn spawn_market_data_dispatch(
    connector: String,
    listener: Arc<dyn MarketDataListener>,
    mut rx: mpsc::Receiver<MarketDataEvent>,
    live: Arc<AtomicBool>,
    events: broadcast::Sender<GatewayEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let outcome = AssertUnwindSafe(listener.on_market_data(&event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report_failure(&events, &connector, listener.name(), e.to_string()),
                Err(payload) => {
                    report_failure(&events, &connector, listener.name(), panic_message(payload))
                }
            }
        }
        live.store(false, Ordering::Release);
        debug!(connector = %connector, listener = listener.name(), "Market data dispatcher stopped");
    })
}

/// Drive an order update listener from an unbounded queue. Order updates are
/// never dropped.
pub(crate) fn spawn_order_update_dispatch(
    connector: String,
    listener: Arc<dyn OrderUpdateListener>,
    mut rx: mpsc::UnboundedReceiver<OrderUpdate>,
    events: broadcast::Sender<GatewayEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            let outcome = AssertUnwindSafe(listener.on_order_update(&update))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report_failure(&events, &connector, listener.name(), e.to_string()),
                Err(payload) => {
                    report_failure(&events, &connector, listener.name(), panic_message(payload))
                }
            }
        }
        debug!(connector = %connector, listener = listener.name(), "Order update dispatcher stopped");
    })
}
