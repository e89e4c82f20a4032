//! Core types used throughout RegimeBot
//!
//! Defines session keys, candles, timeframes, prediction signals and trades.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an account owner
pub type UserId = u64;

/// Identifier assigned to a trade by the ledger
pub type TradeId = u64;

/// Unique key of a trading session: one worker per (user, exchange, symbol)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: UserId,
    pub exchange: String,
    pub symbol: String,
}

impl SessionKey {
    pub fn new(user_id: UserId, exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            user_id,
            exchange: exchange.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.exchange, self.symbol)
    }
}

/// OHLCV candle as returned by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in milliseconds since epoch
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle interval, parsed from exchange notation ("1m", "15m", "1h", "1d", ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe {
    secs: u64,
}

impl Timeframe {
    /// Parse an exchange-style timeframe. Returns `None` for anything malformed.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (idx, unit) = s.char_indices().last()?;
        let amount: u64 = s[..idx].parse().ok().filter(|n| *n > 0)?;
        let unit_secs = match unit {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            'w' => 7 * 24 * 60 * 60,
            'M' => 30 * 24 * 60 * 60,
            'y' => 365 * 24 * 60 * 60,
            _ => return None,
        };
        Some(Self {
            secs: amount.checked_mul(unit_secs)?,
        })
    }

    /// Get duration in seconds
    pub fn duration_secs(&self) -> u64 {
        self.secs
    }
}

/// Trading mode of a user account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "PAPER"),
            TradingMode::Live => write!(f, "LIVE"),
        }
    }
}

/// Discrete oracle output: 1 = buy, 0 = sell/hold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionSignal {
    pub label: u8,
    pub confidence: f64,
}

impl PredictionSignal {
    /// Build a signal, rejecting labels outside {0,1} and confidences outside [0,1]
    pub fn new(label: u8, confidence: f64) -> Option<Self> {
        if label > 1 || !(0.0..=1.0).contains(&confidence) {
            return None;
        }
        Some(Self { label, confidence })
    }

    pub fn is_buy(&self) -> bool {
        self.label == 1
    }
}

impl fmt::Display for PredictionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.is_buy() { "BUY" } else { "SELL/HOLD" };
        write!(f, "{} @ {:.2}% conf.", side, self.confidence * 100.0)
    }
}

/// Trade record owned by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub user_id: UserId,
    pub symbol: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_reason: String,
    /// Notional size chosen by the risk guard
    pub size: f64,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub profit_loss_pct: Option<f64>,
}

impl Trade {
    pub fn is_closed(&self) -> bool {
        self.exit_price.is_some()
    }
}

/// Percentage return of a long trade
pub fn profit_loss_pct(entry_price: f64, exit_price: f64) -> f64 {
    (exit_price - entry_price) / entry_price * 100.0
}

/// A user-facing session log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub user_id: UserId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exchange_timeframes() {
        assert_eq!(Timeframe::parse("1h").unwrap().duration_secs(), 3600);
        assert_eq!(Timeframe::parse("15m").unwrap().duration_secs(), 900);
        assert_eq!(Timeframe::parse("1d").unwrap().duration_secs(), 86_400);
        assert_eq!(Timeframe::parse("1M").unwrap().duration_secs(), 2_592_000);
        assert!(Timeframe::parse("h").is_none());
        assert!(Timeframe::parse("0m").is_none());
        assert!(Timeframe::parse("5x").is_none());
        assert!(Timeframe::parse("").is_none());
    }

    #[test]
    fn prediction_signal_rejects_out_of_range() {
        assert!(PredictionSignal::new(1, 0.85).is_some());
        assert!(PredictionSignal::new(2, 0.5).is_none());
        assert!(PredictionSignal::new(0, 1.2).is_none());
        assert!(PredictionSignal::new(0, f64::NAN).is_none());
    }

    #[test]
    fn session_key_display() {
        let key = SessionKey::new(1, "binance", "BTC/USDT");
        assert_eq!(key.to_string(), "1:binance:BTC/USDT");
    }

    #[test]
    fn pnl_pct_is_relative_to_entry() {
        assert!((profit_loss_pct(100.0, 110.0) - 10.0).abs() < 1e-9);
        assert!((profit_loss_pct(100.0, 95.0) + 5.0).abs() < 1e-9);
    }
}
