//! Exchange collaborator
//!
//! The control loop, the circuit breaker and the data downloader only talk to
//! exchanges through [`Exchange`]. Each session worker gets its own handle from
//! an [`ExchangeConnector`].

mod binance;

pub use binance::{BinanceClient, BinanceConnector};

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{Candle, TradingMode, UserId};

/// Total balance per asset (free + locked)
pub type Balances = HashMap<String, f64>;

/// Exchange failures, split so callers can tell transient I/O from the rest
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transport failure: timeout, connection refused, reset
    #[error("network error: {0}")]
    Network(String),
    /// The exchange answered but rejected or garbled the request
    #[error("exchange error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Exchange { status: Option<u16>, message: String },
    /// No adapter for this exchange id
    #[error("unsupported exchange '{0}'")]
    Unsupported(String),
    /// Missing or unusable account credentials/settings
    #[error("credentials error: {0}")]
    Credentials(String),
}

impl ExchangeError {
    /// Network and exchange-level errors are retried by the control loop
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::Exchange { .. })
    }

    pub(crate) fn exchange(message: impl Into<String>) -> Self {
        ExchangeError::Exchange {
            status: None,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ExchangeError::Network(e.to_string())
        } else {
            ExchangeError::Exchange {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// A connected exchange account
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Paper (sandbox) or live account
    fn mode(&self) -> TradingMode;

    /// Most recent `limit` candles, oldest first
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Total balance per asset
    async fn fetch_balance(&self) -> Result<Balances, ExchangeError>;
}

/// Builds exchange handles for a user
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn connect(
        &self,
        user_id: UserId,
        exchange_id: &str,
    ) -> Result<Box<dyn Exchange>, ExchangeError>;
}
