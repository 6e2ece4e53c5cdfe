use anyhow::{Context, Result};
use gateway_brokers_common::SimulatedVenueConfig;
use gateway_brokers_metatrader::MetaTraderConfig;
use gateway_brokers_oanda::OandaConfig;
use gateway_connector::ConnectorConfig;
use serde::Deserialize;
use std::path::Path;

/// Top-level TOML file for the `gateway` binary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Settings shared by every connector.
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub venues: Vec<VenueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    /// Symbols to subscribe to when running.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(flatten)]
    pub settings: VenueSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VenueSettings {
    Metatrader(MetaTraderConfig),
    Oanda(OandaConfig),
    Simulated(SimulatedVenueConfig),
}

impl VenueSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            VenueSettings::Metatrader(_) => "metatrader",
            VenueSettings::Oanda(_) => "oanda",
            VenueSettings::Simulated(_) => "simulated",
        }
    }
}

/// Secrets that may come from the environment instead of the file.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub oanda_api_token: Option<String>,
    pub mt5_api_key: Option<String>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Fill in credentials the file left out.
    pub fn apply_secrets(&mut self, secrets: &Secrets) {
        for venue in &mut self.venues {
            match &mut venue.settings {
                VenueSettings::Oanda(oanda) if oanda.api_token.is_none() => {
                    oanda.api_token = secrets.oanda_api_token.clone();
                }
                VenueSettings::Metatrader(mt) if mt.api_key.is_none() => {
                    mt.api_key = secrets.mt5_api_key.clone();
                }
                _ => {}
            }
        }
    }
}
