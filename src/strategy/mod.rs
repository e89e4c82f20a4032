//! Decision rule shared by the live control loop and the backtester
//!
//! Both callers hand the same inputs (position flag, price, oracle signal,
//! risk guard) to [`decide`], so a live session and a replay over the same
//! data take the same actions.

use crate::risk::RiskGuard;
use crate::types::{PredictionSignal, TradeId};

/// An open long position held by a live session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpenPosition {
    pub trade_id: TradeId,
    pub entry_price: f64,
    pub size: f64,
}

/// Position state owned by one session worker.
///
/// The active trade id and the entry price only exist while a position is
/// held, so "trade id set iff position held" cannot be violated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionState {
    open: Option<OpenPosition>,
}

impl PositionState {
    pub fn is_held(&self) -> bool {
        self.open.is_some()
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        self.open.as_ref()
    }

    pub fn active_trade_id(&self) -> Option<TradeId> {
        self.open.map(|p| p.trade_id)
    }

    /// Entry price of the held position, 0.0 when flat
    pub fn entry_price(&self) -> f64 {
        self.open.map(|p| p.entry_price).unwrap_or(0.0)
    }

    pub fn open(&mut self, position: OpenPosition) {
        self.open = Some(position);
    }

    /// Clear the position, returning what was held
    pub fn close(&mut self) -> Option<OpenPosition> {
        self.open.take()
    }
}

/// Action chosen for one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Open a long position of `size` at `price`
    Buy { price: f64, size: f64 },
    /// Close the held position at `price` on an oracle sell signal
    Sell { price: f64 },
    /// Close the held position at `price` because it fell below `stop_price`
    StopLoss { price: f64, stop_price: f64 },
    Hold,
}

/// The decision rule.
///
/// - BUY when the oracle says buy, nothing is held and confidence reaches the
///   threshold; size comes from the risk guard.
/// - SELL when the oracle says sell/hold and a position is held.
/// - HOLD otherwise.
pub fn decide(
    position_held: bool,
    price: f64,
    signal: PredictionSignal,
    guard: &RiskGuard,
) -> Action {
    let threshold = guard.config().confidence_threshold;
    match signal.label {
        1 if !position_held && signal.confidence >= threshold => Action::Buy {
            price,
            size: guard.size_for(signal.confidence),
        },
        0 if position_held => Action::Sell { price },
        _ => Action::Hold,
    }
}

/// Stop-loss check for a held position. Pre-empts the oracle when it fires.
pub fn stop_loss_exit(
    position: &OpenPosition,
    price: f64,
    atr: f64,
    guard: &RiskGuard,
) -> Option<Action> {
    guard
        .stop_triggered(position.entry_price, atr, price)
        .then(|| Action::StopLoss {
            price,
            stop_price: guard.stop_for(position.entry_price, atr),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(label: u8, confidence: f64) -> PredictionSignal {
        PredictionSignal::new(label, confidence).unwrap()
    }

    #[test]
    fn buys_with_scaled_size() {
        let guard = RiskGuard::default();
        match decide(false, 100.0, signal(1, 0.85), &guard) {
            Action::Buy { price, size } => {
                assert_eq!(price, 100.0);
                assert!((size - 7.5).abs() < 1e-9, "size was {}", size);
            }
            other => panic!("expected buy, got {:?}", other),
        }
    }

    #[test]
    fn buys_min_size_at_threshold() {
        let guard = RiskGuard::default();
        assert_eq!(
            decide(false, 50.0, signal(1, 0.70), &guard),
            Action::Buy {
                price: 50.0,
                size: 5.0
            }
        );
    }

    #[test]
    fn holds_below_threshold_or_when_already_long() {
        let guard = RiskGuard::default();
        assert_eq!(decide(false, 50.0, signal(1, 0.69), &guard), Action::Hold);
        assert_eq!(decide(true, 50.0, signal(1, 0.95), &guard), Action::Hold);
        assert_eq!(decide(false, 50.0, signal(0, 0.95), &guard), Action::Hold);
    }

    #[test]
    fn sells_held_position_on_zero_label() {
        let guard = RiskGuard::default();
        // confidence does not gate exits
        assert_eq!(
            decide(true, 42.0, signal(0, 0.10), &guard),
            Action::Sell { price: 42.0 }
        );
    }

    #[test]
    fn stop_loss_fires_below_atr_stop() {
        let guard = RiskGuard::default();
        let position = OpenPosition {
            trade_id: 7,
            entry_price: 100.0,
            size: 5.0,
        };
        assert_eq!(
            stop_loss_exit(&position, 95.0, 2.0, &guard),
            Some(Action::StopLoss {
                price: 95.0,
                stop_price: 96.0
            })
        );
        assert_eq!(stop_loss_exit(&position, 96.5, 2.0, &guard), None);
    }

    #[test]
    fn position_state_keeps_trade_id_and_flag_in_step() {
        let mut state = PositionState::default();
        assert!(!state.is_held());
        assert_eq!(state.active_trade_id(), None);
        assert_eq!(state.entry_price(), 0.0);

        state.open(OpenPosition {
            trade_id: 3,
            entry_price: 10.0,
            size: 5.0,
        });
        assert!(state.is_held());
        assert_eq!(state.active_trade_id(), Some(3));

        let closed = state.close().unwrap();
        assert_eq!(closed.trade_id, 3);
        assert!(!state.is_held());
        assert_eq!(state.active_trade_id(), None);
    }
}
