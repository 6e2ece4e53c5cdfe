//! OANDA v20 venue adapter.
//!
//! REST for commands and queries; newline-delimited JSON streams for the
//! account's transactions and for prices.

pub mod client;
pub mod protocol;

pub use client::{OandaAdapter, OandaConfig};
