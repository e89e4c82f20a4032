//! Technical indicators computed on a candle window
//!
//! Only what the control loop needs lives here: true range and a
//! Wilder-smoothed Average True Range used to size the trailing stop.

use crate::types::Candle;

/// Indicators derived from one fetched window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorSnapshot {
    /// Close of the most recent candle
    pub price: f64,
    /// ATR over the configured period, if the window is long enough
    pub atr: Option<f64>,
}

impl IndicatorSnapshot {
    /// Compute indicators for a window. Returns `None` for an empty window.
    pub fn compute(candles: &[Candle], atr_period: usize) -> Option<Self> {
        let last = candles.last()?;
        Some(Self {
            price: last.close,
            atr: atr(candles, atr_period),
        })
    }
}

/// True range of `curr` given the previous close
pub fn true_range(curr: &Candle, prev_close: f64) -> f64 {
    (curr.high - curr.low)
        .max((curr.high - prev_close).abs())
        .max((curr.low - prev_close).abs())
}

/// Average True Range with Wilder smoothing.
///
/// Seeded with the simple mean of the first `period` true ranges, then
/// `atr = (prev * (period - 1) + tr) / period` for every later bar.
/// Needs at least `period + 1` candles.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let tr: Vec<f64> = candles
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .collect();

    let seed = tr[..period].iter().sum::<f64>() / period as f64;
    let n = period as f64;
    let value = tr[period..]
        .iter()
        .fold(seed, |prev, &tr| (prev * (n - 1.0) + tr) / n);

    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn true_range_uses_gap_from_previous_close() {
        let c = candle(105.0, 101.0, 104.0);
        assert_eq!(true_range(&c, 104.0), 4.0);
        // gap up: |high - prev_close| dominates
        assert_eq!(true_range(&c, 95.0), 10.0);
        // gap down: |low - prev_close| dominates
        assert_eq!(true_range(&c, 112.0), 11.0);
    }

    #[test]
    fn atr_requires_period_plus_one_candles() {
        let candles: Vec<Candle> = (0..14).map(|_| candle(101.0, 99.0, 100.0)).collect();
        assert!(atr(&candles, 14).is_none());
        assert!(atr(&candles, 0).is_none());
    }

    #[test]
    fn atr_of_constant_range_equals_range() {
        let candles: Vec<Candle> = (0..40).map(|_| candle(101.0, 99.0, 100.0)).collect();
        let value = atr(&candles, 14).unwrap();
        assert!((value - 2.0).abs() < 1e-9, "got {}", value);
    }

    #[test]
    fn atr_smooths_a_volatility_spike() {
        let mut candles: Vec<Candle> = (0..15).map(|_| candle(101.0, 99.0, 100.0)).collect();
        candles.push(candle(116.0, 100.0, 110.0));
        let value = atr(&candles, 14).unwrap();
        // (2 * 13 + 16) / 14
        assert!((value - 3.0).abs() < 1e-9, "got {}", value);
    }

    #[test]
    fn snapshot_reports_last_close() {
        let candles = vec![candle(11.0, 9.0, 10.0), candle(12.0, 10.0, 11.5)];
        let snap = IndicatorSnapshot::compute(&candles, 14).unwrap();
        assert_eq!(snap.price, 11.5);
        assert!(snap.atr.is_none());
        assert!(IndicatorSnapshot::compute(&[], 14).is_none());
    }
}
