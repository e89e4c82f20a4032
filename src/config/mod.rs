//! Configuration management for RegimeBot
//!
//! Code defaults, then optional `config/default` and `config/local` files,
//! then `REGIMEBOT__SECTION__KEY` environment variables (a `.env` file is
//! loaded first).

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSettings,
    pub risk: RiskConfig,
    pub backtest: BacktestConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub exchange: ExchangeSettings,
    pub oracle: OracleSettings,
    pub persistence: PersistenceSettings,
    pub server: ServerSettings,
    pub log: LogSettings,
    pub users: Vec<UserSeed>,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (REGIMEBOT__*)
            .add_source(Environment::with_prefix("REGIMEBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let risk = &self.risk;
        if !(0.0..=1.0).contains(&risk.confidence_threshold) {
            bail!("risk.confidence_threshold must be within [0, 1]");
        }
        if risk.min_position_size < 0.0 || risk.min_position_size > risk.max_position_size {
            bail!("risk.min_position_size must be between 0 and risk.max_position_size");
        }
        if risk.atr_period == 0 {
            bail!("risk.atr_period must be positive");
        }
        if self.engine.candle_limit <= risk.atr_period {
            bail!("engine.candle_limit must exceed risk.atr_period");
        }
        if self.backtest.initial_balance <= 0.0 {
            bail!("backtest.initial_balance must be positive");
        }
        if self.server.log_channel_capacity == 0 {
            bail!("server.log_channel_capacity must be positive");
        }
        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "timeframe={} conf_thresh={:.2} size={:.1}-{:.1} atr={}x{:.1} breaker={}({:?}) ledger={:?} users={}",
            self.engine.default_timeframe,
            self.risk.confidence_threshold,
            self.risk.min_position_size,
            self.risk.max_position_size,
            self.risk.atr_period,
            self.risk.atr_multiplier,
            if self.circuit_breaker.enabled { "on" } else { "off" },
            self.circuit_breaker.baseline,
            self.persistence.ledger,
            self.users.len()
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
