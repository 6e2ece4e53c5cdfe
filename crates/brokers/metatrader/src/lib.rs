//! MetaTrader 5 venue adapter.
//!
//! Communicates with MT5 via a socket bridge (an MQL5 EA running inside the
//! terminal) using length-prefixed JSON frames.

pub mod client;
pub mod protocol;

pub use client::{MetaTraderAdapter, MetaTraderConfig};
