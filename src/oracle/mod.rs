//! Prediction oracle
//!
//! The oracle turns a window of candles into a buy/sell signal. Feature
//! engineering and the classifiers behind it are opaque to this crate; the
//! control loop, the backtester and the one-shot prediction all go through
//! [`PredictionOracle`].

mod http;

pub use http::HttpOracle;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Candle, PredictionSignal, UserId};

#[derive(Debug, Error)]
pub enum OracleError {
    /// The window does not carry the features the model was trained on
    #[error("feature mismatch: {0}")]
    FeatureMismatch(String),
    /// The user has no trained model
    #[error("model missing: {0}")]
    ModelMissing(String),
    /// Oracle service unreachable or overloaded
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    /// The oracle answered with something that is not a signal
    #[error("invalid oracle response: {0}")]
    InvalidResponse(String),
}

impl OracleError {
    /// Data-class errors skip one cycle in the control loop
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            OracleError::FeatureMismatch(_) | OracleError::ModelMissing(_)
        )
    }

    /// Transient errors are retried after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::Unavailable(_) | OracleError::InvalidResponse(_)
        )
    }
}

impl From<reqwest::Error> for OracleError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            OracleError::InvalidResponse(e.to_string())
        } else {
            OracleError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
pub trait PredictionOracle: Send + Sync {
    /// Signal for the most recent candle of `window`
    async fn predict(
        &self,
        user_id: UserId,
        window: &[Candle],
    ) -> Result<PredictionSignal, OracleError>;

    /// Check that the user's models exist before a session starts
    async fn ensure_ready(&self, _user_id: UserId) -> Result<(), OracleError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_oracle_errors() {
        assert!(OracleError::FeatureMismatch("retrain".into()).is_data());
        assert!(OracleError::ModelMissing("regime".into()).is_data());
        assert!(!OracleError::Unavailable("down".into()).is_data());

        assert!(OracleError::Unavailable("down".into()).is_transient());
        assert!(OracleError::InvalidResponse("label 3".into()).is_transient());
        assert!(!OracleError::FeatureMismatch("retrain".into()).is_transient());
    }
}
