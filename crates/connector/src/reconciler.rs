//! Account and position reconciliation.
//!
//! Pull snapshots and pushed deltas are merged by timestamp: for any one
//! symbol the newest update wins, and a delta older than the last snapshot
//! is discarded as stale. Positions are always replaced whole.

use chrono::{DateTime, Utc};
use gateway_core::*;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::tracker::FillDelta;

/// One consistent view of a connector's account and positions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledView {
    pub connector: String,
    pub account: Option<Account>,
    pub positions: Vec<Position>,
    pub as_of: DateTime<Utc>,
}

#[derive(Default)]
struct Book {
    account: Option<Account>,
    positions: HashMap<String, Position>,
    last_snapshot_at: Option<DateTime<Utc>>,
}

impl Book {
    fn is_stale(&self, symbol: &str, at: DateTime<Utc>) -> bool {
        if matches!(self.last_snapshot_at, Some(snap) if at < snap) {
            return true;
        }
        matches!(self.positions.get(symbol), Some(p) if at < p.updated_at)
    }
}

pub struct Reconciler {
    connector: String,
    book: RwLock<Book>,
    events: broadcast::Sender<GatewayEvent>,
}

impl Reconciler {
    pub fn new(connector: &str, events: broadcast::Sender<GatewayEvent>) -> Self {
        Self {
            connector: connector.to_string(),
            book: RwLock::new(Book::default()),
            events,
        }
    }

    fn stale(&self, symbol: &str) {
        debug!(connector = %self.connector, symbol, "Discarding stale position update");
        let _ = self.events.send(GatewayEvent::StaleUpdateDiscarded {
            connector: self.connector.clone(),
            symbol: symbol.to_string(),
        });
    }

    /// Keep the newer of the held and the incoming account.
    pub fn apply_account(&self, account: Account) -> bool {
        let mut book = self.book.write().unwrap_or_else(PoisonError::into_inner);
        match &book.account {
            Some(held) if held.updated_at > account.updated_at => false,
            _ => {
                book.account = Some(account);
                true
            }
        }
    }

    /// Merge a full position pull taken at `as_of`.
    pub fn apply_snapshot(&self, positions: Vec<Position>, as_of: DateTime<Utc>) {
        let mut book = self.book.write().unwrap_or_else(PoisonError::into_inner);
        let mut incoming: HashMap<String, Position> = positions
            .into_iter()
            .filter(|p| !p.is_flat())
            .map(|p| (p.symbol.clone(), p))
            .collect();

        // Symbols the venue no longer reports are flat, unless a newer push
        // already told us otherwise.
        book.positions.retain(|symbol, held| {
            incoming.contains_key(symbol) || held.updated_at > as_of
        });
        for (symbol, position) in incoming.drain() {
            match book.positions.get(&symbol) {
                Some(held) if held.updated_at > as_of => {}
                _ => {
                    book.positions.insert(symbol, position);
                }
            }
        }
        book.last_snapshot_at = Some(match book.last_snapshot_at {
            Some(prev) if prev > as_of => prev,
            _ => as_of,
        });
    }

    /// A venue pushed a full position for one symbol.
    pub fn apply_position(&self, position: Position) -> bool {
        let mut book = self.book.write().unwrap_or_else(PoisonError::into_inner);
        if book.is_stale(&position.symbol, position.updated_at) {
            drop(book);
            self.stale(&position.symbol);
            return false;
        }
        if position.is_flat() {
            book.positions.remove(&position.symbol);
        } else {
            book.positions.insert(position.symbol.clone(), position);
        }
        true
    }

    /// Fold one execution into the position for its symbol.
    pub fn apply_fill(&self, fill: &FillDelta) -> bool {
        let mut book = self.book.write().unwrap_or_else(PoisonError::into_inner);
        if book.is_stale(&fill.symbol, fill.timestamp) {
            drop(book);
            self.stale(&fill.symbol);
            return false;
        }

        let (held_qty, held_avg) = book
            .positions
            .get(&fill.symbol)
            .map(|p| (p.net_quantity, p.avg_price))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        let delta = fill.side.sign() * fill.quantity;
        let net = held_qty + delta;

        if net.is_zero() {
            book.positions.remove(&fill.symbol);
            return true;
        }

        let avg = if held_qty.is_zero() || (held_qty > Decimal::ZERO) != (net > Decimal::ZERO) {
            // Opened fresh, or flipped through zero.
            fill.price
        } else if (held_qty > Decimal::ZERO) == (delta > Decimal::ZERO) {
            (held_avg * held_qty.abs() + fill.price * fill.quantity) / net.abs()
        } else {
            // Reduced without flipping.
            held_avg
        };

        book.positions.insert(
            fill.symbol.clone(),
            Position {
                symbol: fill.symbol.clone(),
                net_quantity: net,
                avg_price: avg,
                unrealized_pnl: (fill.price - avg) * net,
                updated_at: fill.timestamp,
            },
        );
        true
    }

    /// Re-mark a position's unrealized P&L at the quote's mid price.
    pub fn mark(&self, quote: &Quote) {
        let mut book = self.book.write().unwrap_or_else(PoisonError::into_inner);
        let Some(held) = book.positions.get(&quote.symbol) else {
            return;
        };
        let marked = Position {
            unrealized_pnl: held.pnl_at(quote.mid()),
            ..held.clone()
        };
        book.positions.insert(quote.symbol.clone(), marked);
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .positions
            .get(symbol)
            .cloned()
    }

    pub fn account(&self) -> Option<Account> {
        self.book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .account
            .clone()
    }

    pub fn positions(&self) -> Vec<Position> {
        let book = self.book.read().unwrap_or_else(PoisonError::into_inner);
        let mut positions: Vec<Position> = book.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn snapshot(&self) -> ReconciledView {
        let book = self.book.read().unwrap_or_else(PoisonError::into_inner);
        let mut positions: Vec<Position> = book.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        ReconciledView {
            connector: self.connector.clone(),
            account: book.account.clone(),
            positions,
            as_of: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn reconciler() -> Reconciler {
        let (tx, _) = broadcast::channel(16);
        Reconciler::new("test", tx)
    }

    fn position(symbol: &str, qty: Decimal, at: DateTime<Utc>) -> Position {
        Position {
            symbol: symbol.into(),
            net_quantity: qty,
            avg_price: dec!(1.10),
            unrealized_pnl: Decimal::ZERO,
            updated_at: at,
        }
    }

    fn fill(side: Side, qty: Decimal, price: Decimal, at: DateTime<Utc>) -> FillDelta {
        FillDelta {
            symbol: "EURUSD".into(),
            side,
            quantity: qty,
            price,
            timestamp: at,
        }
    }

    #[test]
    fn test_fill_before_snapshot_is_stale() {
        let rec = reconciler();
        let now = Utc::now();
        rec.apply_snapshot(vec![position("EURUSD", dec!(100), now)], now);

        assert!(!rec.apply_fill(&fill(Side::Buy, dec!(50), dec!(1.2), now - Duration::seconds(1))));
        assert_eq!(rec.position("EURUSD").unwrap().net_quantity, dec!(100));

        assert!(rec.apply_fill(&fill(Side::Buy, dec!(50), dec!(1.2), now + Duration::seconds(1))));
        assert_eq!(rec.position("EURUSD").unwrap().net_quantity, dec!(150));
    }

    #[test]
    fn test_fill_netting() {
        let rec = reconciler();
        let t0 = Utc::now();
        rec.apply_fill(&fill(Side::Buy, dec!(100), dec!(1.00), t0));
        rec.apply_fill(&fill(Side::Buy, dec!(100), dec!(1.20), t0 + Duration::seconds(1)));
        let pos = rec.position("EURUSD").unwrap();
        assert_eq!(pos.net_quantity, dec!(200));
        assert_eq!(pos.avg_price, dec!(1.10));

        rec.apply_fill(&fill(Side::Sell, dec!(50), dec!(1.30), t0 + Duration::seconds(2)));
        assert_eq!(rec.position("EURUSD").unwrap().avg_price, dec!(1.10));

        rec.apply_fill(&fill(Side::Sell, dec!(250), dec!(1.30), t0 + Duration::seconds(3)));
        let flipped = rec.position("EURUSD").unwrap();
        assert_eq!(flipped.net_quantity, dec!(-100));
        assert_eq!(flipped.avg_price, dec!(1.30));

        rec.apply_fill(&fill(Side::Buy, dec!(100), dec!(1.25), t0 + Duration::seconds(4)));
        assert!(rec.position("EURUSD").is_none());
    }

    #[test]
    fn test_snapshot_keeps_newer_push() {
        let rec = reconciler();
        let snap_at = Utc::now();
        rec.apply_position(position("GBPUSD", dec!(10), snap_at + Duration::seconds(5)));
        rec.apply_position(position("USDJPY", dec!(10), snap_at - Duration::seconds(5)));

        rec.apply_snapshot(vec![position("EURUSD", dec!(1), snap_at)], snap_at);

        let symbols: Vec<String> = rec.positions().into_iter().map(|p| p.symbol).collect();
        assert_eq!(symbols, vec!["EURUSD".to_string(), "GBPUSD".to_string()]);
    }

    #[test]
    fn test_newer_account_wins() {
        let rec = reconciler();
        let now = Utc::now();
        let account = |equity: Decimal, at| Account {
            id: "A1".into(),
            balance: dec!(1000),
            equity,
            currency: "USD".into(),
            unrealized_pnl: Decimal::ZERO,
            margin_used: Decimal::ZERO,
            updated_at: at,
        };
        assert!(rec.apply_account(account(dec!(1000), now)));
        assert!(!rec.apply_account(account(dec!(900), now - Duration::seconds(1))));
        assert_eq!(rec.account().unwrap().equity, dec!(1000));
    }

    #[test]
    fn test_mark_updates_unrealized_pnl() {
        let rec = reconciler();
        let now = Utc::now();
        rec.apply_position(position("EURUSD", dec!(1000), now));
        rec.mark(&Quote {
            symbol: "EURUSD".into(),
            bid: dec!(1.11),
            ask: dec!(1.13),
            last: None,
            timestamp: now,
        });
        assert_eq!(rec.position("EURUSD").unwrap().unrealized_pnl, dec!(20));
    }
}
