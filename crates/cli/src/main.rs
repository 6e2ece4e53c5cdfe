mod config;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use gateway_brokers_common::SimulatedVenue;
use gateway_brokers_metatrader::MetaTraderAdapter;
use gateway_brokers_oanda::OandaAdapter;
use gateway_connector::{Connector, ConnectorConfig};
use gateway_core::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{GatewayConfig, Secrets, VenueSettings};

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Unified trading gateway for MetaTrader, OANDA and simulated venues")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// OANDA personal access token
    #[arg(long, env = "OANDA_API_TOKEN", hide_env_values = true)]
    oanda_api_token: Option<String>,

    /// API key expected by the MetaTrader bridge EA
    #[arg(long, env = "MT5_API_KEY", hide_env_values = true)]
    mt5_api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every configured venue and log traffic until Ctrl-C
    Run {
        /// Path to the TOML config file
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,
    },

    /// Print the reconciled account and positions of one venue
    Account {
        #[arg(short, long, default_value = "gateway.toml")]
        config: PathBuf,

        /// Venue name (e.g. "OANDA", "MetaTrader")
        #[arg(short, long)]
        venue: String,
    },

    /// List supported venue kinds
    Venues,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    let secrets = Secrets {
        oanda_api_token: cli.oanda_api_token,
        mt5_api_key: cli.mt5_api_key,
    };

    match cli.command {
        Commands::Run { config } => {
            let mut config = GatewayConfig::load(&config)?;
            config.apply_secrets(&secrets);
            run(config).await?;
        }
        Commands::Account { config, venue } => {
            let mut config = GatewayConfig::load(&config)?;
            config.apply_secrets(&secrets);
            account(config, &venue).await?;
        }
        Commands::Venues => {
            println!("Supported venues:");
            println!("  metatrader - MetaTrader 5 through a TCP bridge EA (host, port, api_key)");
            println!("  oanda      - OANDA v20 REST + streaming (account_id, api_token, live)");
            println!("  simulated  - In-process paper venue (account_id, initial_balance)");
        }
    }

    Ok(())
}

fn build_connector(settings: &VenueSettings, config: &ConnectorConfig) -> Connector {
    let adapter: Arc<dyn VenueAdapter> = match settings {
        VenueSettings::Metatrader(mt) => Arc::new(MetaTraderAdapter::new(mt.clone())),
        VenueSettings::Oanda(oanda) => Arc::new(OandaAdapter::new(oanda.clone())),
        VenueSettings::Simulated(sim) => Arc::new(SimulatedVenue::new(sim.clone())),
    };
    Connector::new(adapter, config.clone())
}

/// Logs every quote it receives.
struct QuoteLogger;

#[async_trait]
impl MarketDataListener for QuoteLogger {
    fn name(&self) -> &str {
        "quote-logger"
    }

    async fn on_market_data(&self, event: &MarketDataEvent) -> Result<(), ListenerError> {
        let MarketDataEvent::Quote { connector, quote } = event;
        info!(
            connector = %connector,
            symbol = %quote.symbol,
            bid = %quote.bid,
            ask = %quote.ask,
            "Quote"
        );
        Ok(())
    }
}

/// Logs every order state transition.
struct OrderLogger;

#[async_trait]
impl OrderUpdateListener for OrderLogger {
    fn name(&self) -> &str {
        "order-logger"
    }

    async fn on_order_update(&self, update: &OrderUpdate) -> Result<(), ListenerError> {
        info!(
            connector = %update.connector,
            correlation_id = %update.order.correlation_id,
            venue_id = ?update.order.venue_id,
            from = ?update.previous,
            to = ?update.order.status,
            filled = %update.order.filled_quantity,
            "Order update"
        );
        Ok(())
    }
}

/// Forward a connector's observability stream into the log.
fn log_gateway_events(mut events: broadcast::Receiver<GatewayEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(GatewayEvent::ListenerFailed {
                    connector,
                    listener,
                    error,
                }) => {
                    error!(connector = %connector, listener = %listener, error = %error, "Listener failed")
                }
                Ok(GatewayEvent::ConnectionFailed { connector, error }) => {
                    error!(connector = %connector, error = %error, "Connection failed")
                }
                Ok(event) => info!(event = ?event, "Gateway event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Gateway event log lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn run(config: GatewayConfig) -> Result<()> {
    if config.venues.is_empty() {
        bail!("No venues configured");
    }

    let mut connectors = Vec::new();
    let mut loggers = Vec::new();
    let quotes: Arc<dyn MarketDataListener> = Arc::new(QuoteLogger);
    let orders: Arc<dyn OrderUpdateListener> = Arc::new(OrderLogger);

    for venue in &config.venues {
        let connector = build_connector(&venue.settings, &config.connector);
        loggers.push(log_gateway_events(connector.events()));

        if let Err(e) = connector.connect().await {
            error!(connector = %connector.get_connector_name(), error = %e, "Connect failed");
            continue;
        }
        connector.subscribe_to_order_updates(orders.clone())?;
        if !venue.symbols.is_empty() {
            connector
                .subscribe_to_market_data(&venue.symbols, quotes.clone())
                .await
                .with_context(|| format!("subscribing on {}", connector.get_connector_name()))?;
        }
        info!(
            connector = %connector.get_connector_name(),
            symbols = ?venue.symbols,
            "Venue ready"
        );
        connectors.push(connector);
    }

    if connectors.is_empty() {
        bail!("No venue could be connected");
    }

    info!(venues = connectors.len(), "Gateway running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for connector in &connectors {
        connector.disconnect().await;
    }
    for logger in loggers {
        logger.abort();
    }
    Ok(())
}

async fn account(config: GatewayConfig, venue: &str) -> Result<()> {
    let connectors: Vec<Connector> = config
        .venues
        .iter()
        .map(|v| build_connector(&v.settings, &config.connector))
        .collect();
    let Some(connector) = connectors
        .into_iter()
        .find(|c| c.get_connector_name().eq_ignore_ascii_case(venue))
    else {
        bail!("Venue {venue} is not configured");
    };

    connector.connect().await?;
    let account = connector.get_account().await?;
    let positions = connector.get_positions().await?;
    connector.disconnect().await;

    let sep = "=".repeat(60);
    println!("\n{sep}");
    println!("  {} ACCOUNT {}", connector.get_connector_name(), account.id);
    println!("{sep}");
    println!("  Balance:          {:.2} {}", account.balance, account.currency);
    println!("  Equity:           {:.2}", account.equity);
    println!("  Unrealized P&L:   {:.2}", account.unrealized_pnl);
    println!("  Margin Used:      {:.2}", account.margin_used);
    println!("  Margin Available: {:.2}", account.margin_available());
    println!("{sep}");
    if positions.is_empty() {
        println!("  No open positions");
    }
    for position in &positions {
        println!(
            "  {:<10} {:>12} @ {:<12} P&L {:.2}",
            position.symbol, position.net_quantity, position.avg_price, position.unrealized_pnl
        );
    }
    println!("{sep}\n");

    Ok(())
}
