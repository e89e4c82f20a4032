//! Configuration sections
//!
//! Every section has code defaults so a bare environment still yields a
//! working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::persistence::settings::UserSettings;
use crate::risk::circuit_breaker::{Baseline, BreakerConfig};
use crate::session::ControlLoopConfig;
use crate::types::UserId;

pub use crate::backtesting::BacktestConfig;
pub use crate::risk::RiskConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Candle timeframe traded by every session
    pub default_timeframe: String,
    pub candle_limit: usize,
    pub candle_buffer_secs: u64,
    pub min_sleep_secs: u64,
    pub fallback_interval_secs: u64,
    pub empty_data_backoff_secs: u64,
    pub error_backoff_secs: u64,
    /// How long shutdown waits for workers before aborting them
    pub shutdown_grace_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_timeframe: "1h".to_string(),
            candle_limit: 200,
            candle_buffer_secs: 5,
            min_sleep_secs: 5,
            fallback_interval_secs: 900,
            empty_data_backoff_secs: 60,
            error_backoff_secs: 60,
            shutdown_grace_secs: 10,
        }
    }
}

impl From<&EngineSettings> for ControlLoopConfig {
    fn from(s: &EngineSettings) -> Self {
        Self {
            timeframe: s.default_timeframe.clone(),
            candle_limit: s.candle_limit,
            candle_buffer: Duration::from_secs(s.candle_buffer_secs),
            min_sleep: Duration::from_secs(s.min_sleep_secs),
            fallback_interval: Duration::from_secs(s.fallback_interval_secs),
            empty_data_backoff: Duration::from_secs(s.empty_data_backoff_secs),
            error_backoff: Duration::from_secs(s.error_backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Asset whose total balance is tracked
    pub quote_asset: String,
    pub baseline: Baseline,
    pub lookback_hours: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
            quote_asset: "USDT".to_string(),
            baseline: Baseline::Snapshot,
            lookback_hours: 24,
        }
    }
}

impl From<&CircuitBreakerSettings> for BreakerConfig {
    fn from(s: &CircuitBreakerSettings) -> Self {
        Self {
            quote_asset: s.quote_asset.clone(),
            baseline: s.baseline,
            lookback: Duration::from_secs(s.lookback_hours * 3600),
            interval: Duration::from_secs(s.interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// Binance spot REST endpoint used by live accounts
    pub binance_rest_url: String,
    /// Binance spot testnet used by paper accounts
    pub binance_testnet_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            binance_rest_url: "https://api.binance.com".to_string(),
            binance_testnet_url: "https://testnet.binance.vision".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    /// Model service endpoint
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    #[default]
    Csv,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Root of the trade ledger and downloaded candle files
    pub data_dir: String,
    pub ledger: LedgerKind,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            ledger: LedgerKind::Csv,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    /// Lines buffered per log-stream subscriber
    pub log_channel_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            log_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Emit JSON lines instead of the human-readable format
    pub json: bool,
    /// Filter used when RUST_LOG is unset
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info,regimebot=debug".to_string(),
        }
    }
}

/// A user account declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    pub id: UserId,
    #[serde(flatten)]
    pub settings: UserSettings,
}
