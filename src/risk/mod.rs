//! Risk Manager - Position sizing and stop-loss rules
//!
//! Implements:
//! - Confidence-scaled position sizing
//! - ATR trailing stop-loss
//! - Account drawdown circuit breaker (see [`circuit_breaker`])
//!
//! The sizing and stop functions are pure so the live control loop and the
//! backtester produce identical numbers from identical inputs.

pub mod circuit_breaker;

use serde::{Deserialize, Serialize};

/// Risk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Lookback period for the ATR volatility measure
    pub atr_period: usize,
    /// Stop distance below entry, in ATRs
    pub atr_multiplier: f64,
    /// Minimum oracle confidence to open a position
    pub confidence_threshold: f64,
    /// Size used at exactly the threshold confidence
    pub min_position_size: f64,
    /// Size used at full confidence
    pub max_position_size: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            atr_multiplier: 2.0,
            confidence_threshold: 0.70,
            min_position_size: 5.0,
            max_position_size: 15.0,
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    Signal,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::Signal => write!(f, "SIGNAL"),
        }
    }
}

/// Stop price a fixed number of ATRs below entry
pub fn stop_loss_price(entry_price: f64, atr: f64, multiplier: f64) -> f64 {
    entry_price - atr * multiplier
}

/// Confidence-scaled position size.
///
/// `scale = clamp((confidence - threshold) / (1 - threshold), 0, 1)` and
/// `size = max(min_size, max_size * scale)`, so the threshold itself maps to
/// `min_size`. A threshold of 1.0 or more has no room to scale and also maps
/// to `min_size`.
pub fn position_size(confidence: f64, threshold: f64, min_size: f64, max_size: f64) -> f64 {
    let room = 1.0 - threshold;
    let scale = if room > 0.0 {
        ((confidence - threshold) / room).clamp(0.0, 1.0)
    } else {
        0.0
    };
    min_size.max(max_size * scale)
}

/// Risk guard bound to a configuration
#[derive(Debug, Clone, Default)]
pub struct RiskGuard {
    config: RiskConfig,
}

impl RiskGuard {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Calculate position size for an oracle confidence
    pub fn size_for(&self, confidence: f64) -> f64 {
        position_size(
            confidence,
            self.config.confidence_threshold,
            self.config.min_position_size,
            self.config.max_position_size,
        )
    }

    /// Stop-loss price for a position opened at `entry_price`
    pub fn stop_for(&self, entry_price: f64, atr: f64) -> f64 {
        stop_loss_price(entry_price, atr, self.config.atr_multiplier)
    }

    /// Whether `price` has crossed below the ATR stop of a position
    pub fn stop_triggered(&self, entry_price: f64, atr: f64, price: f64) -> bool {
        price < self.stop_for(entry_price, atr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_sizing() {
        // (0.85 - 0.70) / 0.30 = 0.5 -> 15 * 0.5 = 7.5
        let size = position_size(0.85, 0.70, 5.0, 15.0);
        assert!((size - 7.5).abs() < 1e-9, "Expected 7.5, got {:.4}", size);

        // Full confidence uses the max size
        let size = position_size(1.0, 0.70, 5.0, 15.0);
        assert!((size - 15.0).abs() < 1e-9);

        // Just above threshold: scaled size is below min, so min wins
        let size = position_size(0.75, 0.70, 5.0, 15.0);
        assert!((size - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_size_at_threshold_is_min() {
        let size = position_size(0.70, 0.70, 5.0, 15.0);
        assert_eq!(size, 5.0);

        // Below threshold clamps to zero scale as well
        let size = position_size(0.10, 0.70, 5.0, 15.0);
        assert_eq!(size, 5.0);
    }

    #[test]
    fn test_degenerate_threshold() {
        assert_eq!(position_size(1.0, 1.0, 5.0, 15.0), 5.0);
        assert_eq!(position_size(1.0, 1.5, 5.0, 15.0), 5.0);
    }

    #[test]
    fn test_stop_loss_price() {
        assert_eq!(stop_loss_price(100.0, 2.0, 2.0), 96.0);

        let guard = RiskGuard::default();
        assert_eq!(guard.stop_for(100.0, 2.0), 96.0);
        assert!(guard.stop_triggered(100.0, 2.0, 95.0));
        assert!(!guard.stop_triggered(100.0, 2.0, 96.0));
        assert!(!guard.stop_triggered(100.0, 2.0, 99.0));
    }

    #[test]
    fn test_guard_uses_config() {
        let guard = RiskGuard::new(RiskConfig {
            confidence_threshold: 0.60,
            min_position_size: 1.0,
            max_position_size: 10.0,
            ..Default::default()
        });
        // (0.80 - 0.60) / 0.40 = 0.5 -> 5.0
        assert!((guard.size_for(0.80) - 5.0).abs() < 1e-9);
    }
}
