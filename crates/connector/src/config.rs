use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection policy: exponential backoff with a delay cap and a
/// maximum number of attempts before the connector gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Attempts before the connector moves to `Failed`.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Delay to wait before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Settings shared by every connector instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// How long an order may stay unacknowledged before it is rejected.
    pub ack_timeout_ms: u64,
    /// Upper bound for opening the venue transport.
    pub connect_timeout_ms: u64,
    /// Health check period while connected.
    pub heartbeat_interval_secs: u64,
    /// Period of account/position pulls while connected.
    pub reconcile_interval_secs: u64,
    /// Per-listener queue depth for market data. Events beyond it are
    /// dropped for that listener only.
    pub market_data_queue: usize,
    /// Number of terminal orders kept queryable after they finish.
    pub terminal_retention: usize,
    /// Capacity of the observability broadcast channel.
    pub event_buffer: usize,
    pub backoff: BackoffConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            heartbeat_interval_secs: 10,
            reconcile_interval_secs: 30,
            market_data_queue: 1024,
            terminal_retention: 10_000,
            event_buffer: 256,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConnectorConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}
