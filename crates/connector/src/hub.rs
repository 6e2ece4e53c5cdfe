//! Market data fan-out.
//!
//! The hub keeps one venue-level subscription per symbol no matter how many
//! listeners want it, and copies each inbound quote into every interested
//! listener's queue.

use dashmap::DashMap;
use gateway_core::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::spawn_market_data_dispatch;

/// Identity of a listener: the address of the shared listener object.
/// Subscribing the same `Arc` twice maps to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenerKey(usize);

impl ListenerKey {
    fn of(listener: &Arc<dyn MarketDataListener>) -> Self {
        Self(Arc::as_ptr(listener) as *const () as usize)
    }
}

struct ListenerSlot {
    tx: mpsc::Sender<MarketDataEvent>,
    symbols: HashSet<String>,
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Result of registering interest.
#[derive(Debug)]
pub struct HubSubscription {
    pub subscription: MarketDataSubscription,
    /// Symbols nobody listened to before; the venue must be subscribed.
    pub newly_active: Vec<String>,
}

pub struct FanOutHub {
    connector: String,
    queue_capacity: usize,
    symbols: DashMap<String, HashSet<ListenerKey>>,
    listeners: DashMap<ListenerKey, ListenerSlot>,
    subscriptions: DashMap<u64, (ListenerKey, Vec<String>)>,
    next_subscription: AtomicU64,
    events: broadcast::Sender<GatewayEvent>,
}

impl FanOutHub {
    pub fn new(connector: &str, queue_capacity: usize, events: broadcast::Sender<GatewayEvent>) -> Self {
        Self {
            connector: connector.to_string(),
            queue_capacity: queue_capacity.max(1),
            symbols: DashMap::new(),
            listeners: DashMap::new(),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            events,
        }
    }

    /// Register `listener` for `symbols`. Pairs that already exist are left
    /// alone, so re-subscribing never causes duplicate delivery.
    pub fn subscribe(
        &self,
        symbols: &[String],
        listener: Arc<dyn MarketDataListener>,
    ) -> Result<HubSubscription, GatewayError> {
        let key = ListenerKey::of(&listener);
        let mut slot = self.listeners.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.queue_capacity);
            let live = Arc::new(AtomicBool::new(true));
            let task = spawn_market_data_dispatch(
                self.connector.clone(),
                listener.clone(),
                rx,
                live.clone(),
                self.events.clone(),
            );
            ListenerSlot {
                tx,
                symbols: HashSet::new(),
                live,
                task,
            }
        });

        let mut added = Vec::new();
        let mut newly_active = Vec::new();
        for symbol in symbols {
            if !slot.symbols.insert(symbol.clone()) {
                continue;
            }
            let mut holders = self.symbols.entry(symbol.clone()).or_default();
            let first = holders.is_empty();
            if !holders.insert(key) {
                // The slot and the symbol map disagree; this is a bug in
                // the hub's own bookkeeping.
                debug_assert!(false, "listener already registered for {symbol}");
                return Err(GatewayError::DuplicateSubscription {
                    symbol: symbol.clone(),
                });
            }
            added.push(symbol.clone());
            if first {
                newly_active.push(symbol.clone());
            }
        }
        let live = slot.live.clone();
        drop(slot);

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(id, (key, added.clone()));
        debug!(
            connector = %self.connector,
            subscription = id,
            symbols = ?added,
            new = ?newly_active,
            "Market data subscription registered"
        );

        Ok(HubSubscription {
            subscription: MarketDataSubscription::new(id, added, listener.name().to_string(), live),
            newly_active,
        })
    }

    /// Remove a subscription. Returns symbols that no listener wants any more,
    /// which the venue should be unsubscribed from.
    pub fn unsubscribe(&self, subscription_id: u64) -> Vec<String> {
        let Some((_, (key, symbols))) = self.subscriptions.remove(&subscription_id) else {
            return Vec::new();
        };

        let mut vacated = Vec::new();
        let mut retire = false;
        if let Some(mut slot) = self.listeners.get_mut(&key) {
            for symbol in &symbols {
                if !slot.symbols.remove(symbol) {
                    continue;
                }
                let emptied = match self.symbols.get_mut(symbol) {
                    Some(mut holders) => {
                        holders.remove(&key);
                        holders.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.symbols.remove_if(symbol, |_, holders| holders.is_empty());
                    vacated.push(symbol.clone());
                }
            }
            retire = slot.symbols.is_empty();
        }

        if retire {
            if let Some((_, slot)) = self.listeners.remove(&key) {
                // Dropping the sender lets the dispatcher drain and exit.
                slot.live.store(false, Ordering::Release);
                drop(slot.tx);
                drop(slot.task);
            }
        }
        vacated
    }

    /// Copy an event into the queue of every listener of its symbol.
    /// Never waits: a full queue drops the event for that listener only.
    pub fn publish(&self, event: MarketDataEvent) -> usize {
        let keys: Vec<ListenerKey> = match self.symbols.get(event.symbol()) {
            Some(holders) => holders.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for key in keys {
            let Some(slot) = self.listeners.get(&key) else {
                continue;
            };
            match slot.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        connector = %self.connector,
                        symbol = event.symbol(),
                        "Listener queue full, dropping market data event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slot.live.store(false, Ordering::Release);
                }
            }
        }
        delivered
    }

    /// Every symbol with at least one listener.
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .symbols
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        symbols.sort();
        symbols
    }

    pub fn listener_count(&self, symbol: &str) -> usize {
        self.symbols.get(symbol).map(|h| h.len()).unwrap_or(0)
    }
}

impl Drop for FanOutHub {
    fn drop(&mut self) {
        for slot in self.listeners.iter() {
            slot.live.store(false, Ordering::Release);
            slot.task.abort();
        }
    }
}
