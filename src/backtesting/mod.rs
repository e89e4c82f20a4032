//! Backtesting Module
//!
//! Replays the live decision rule over a stored candle series:
//! - same `strategy::decide` call as the control loop
//! - taker fee and slippage applied on every fill
//! - per-trade returns compounded into an equity curve
//!
//! The replay only follows oracle signals; the ATR stop is a live-session
//! safeguard and is not simulated here.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::oracle::PredictionOracle;
use crate::persistence::HistoryError;
use crate::risk::RiskGuard;
use crate::strategy::{decide, Action};
use crate::types::{Candle, UserId};

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Starting balance in quote currency
    pub initial_balance: f64,
    /// Fee charged on the balance at every entry and exit (fraction)
    pub taker_fee: f64,
    /// Price slippage against us on every fill (fraction)
    pub slippage: f64,
    /// Bars skipped before the first decision
    pub warmup_bars: usize,
    /// Timeframe of the stored series
    pub timeframe: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_balance: 1000.0,
            taker_fee: 0.001,
            slippage: 0.0005,
            warmup_bars: 50,
            timeframe: "1h".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("data series too short for a meaningful backtest ({have} candles, need {need})")]
    InsufficientData { have: usize, need: usize },
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// One point of the cumulative return curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    /// "%Y-%m-%d %H:%M"
    pub timestamp: String,
    /// Compounded return in percent, 4 decimals
    pub cumulative_pct: f64,
}

/// Backtest result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub total_return_pct: f64,
    /// Entries taken
    pub trade_count: usize,
    pub win_rate_pct: f64,
    pub final_balance: f64,
    /// Fractional return of every closed trade, in order
    pub returns: Vec<f64>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Backtester
#[derive(Debug, Clone, Default)]
pub struct BacktestEngine {
    config: BacktestConfig,
    guard: RiskGuard,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig, guard: RiskGuard) -> Self {
        Self { config, guard }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run the replay over `candles` (oldest first).
    ///
    /// At bar `i` the oracle sees `candles[..i]` and the fill happens at
    /// `candles[i].close`. Oracle errors are treated as a hold for that bar.
    /// A position still open at the end is not realized. `origin` anchors the
    /// equity curve timestamps.
    pub async fn run(
        &self,
        oracle: &dyn PredictionOracle,
        user_id: UserId,
        candles: &[Candle],
        origin: DateTime<Utc>,
    ) -> Result<BacktestReport, BacktestError> {
        let warmup = self.config.warmup_bars;
        if candles.len() < warmup {
            return Err(BacktestError::InsufficientData {
                have: candles.len(),
                need: warmup,
            });
        }

        let fee = self.config.taker_fee;
        let slippage = self.config.slippage;

        let mut balance = self.config.initial_balance;
        let mut entry: Option<f64> = None;
        let mut trade_count = 0usize;
        let mut wins = 0usize;
        let mut returns = Vec::new();
        let mut skipped = 0usize;

        for i in warmup..candles.len() {
            let signal = match oracle.predict(user_id, &candles[..i]).await {
                Ok(signal) => signal,
                Err(e) => {
                    skipped += 1;
                    debug!(bar = i, error = %e, "Oracle error during backtest, holding");
                    continue;
                }
            };
            let price = candles[i].close;

            match (decide(entry.is_some(), price, signal, &self.guard), entry) {
                (Action::Buy { .. }, None) => {
                    entry = Some(price * (1.0 + slippage));
                    balance -= balance * fee;
                    trade_count += 1;
                }
                (Action::Sell { .. }, Some(entry_price)) => {
                    let exit_price = price * (1.0 - slippage);
                    let r = (exit_price - entry_price) / entry_price;
                    returns.push(r);
                    if r > 0.0 {
                        wins += 1;
                    }
                    balance *= 1.0 + r;
                    balance -= balance * fee;
                    entry = None;
                }
                _ => {}
            }
        }

        let total_return_pct = (balance / self.config.initial_balance - 1.0) * 100.0;
        let win_rate_pct = if trade_count > 0 {
            wins as f64 / trade_count as f64 * 100.0
        } else {
            0.0
        };

        info!(
            user_id,
            bars = candles.len() - warmup,
            trade_count,
            skipped,
            total_return_pct,
            "Backtest finished"
        );

        Ok(BacktestReport {
            total_return_pct,
            trade_count,
            win_rate_pct,
            final_balance: balance,
            equity_curve: equity_curve(&returns, origin),
            returns,
        })
    }
}

/// Compound `returns` into a curve with one synthetic hourly point per trade
pub fn equity_curve(returns: &[f64], origin: DateTime<Utc>) -> Vec<EquityPoint> {
    let mut cumulative = 1.0;
    returns
        .iter()
        .enumerate()
        .map(|(i, r)| {
            cumulative *= 1.0 + r;
            EquityPoint {
                timestamp: (origin + Duration::hours(i as i64))
                    .format("%Y-%m-%d %H:%M")
                    .to_string(),
                cumulative_pct: round4((cumulative - 1.0) * 100.0),
            }
        })
        .collect()
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}
