//! Trading service facade
//!
//! The operations exposed to clients: session control, backtests, one-shot
//! predictions, data downloads, trade history and log streams. Transport
//! layers (the HTTP API) only translate requests into these calls.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::backtesting::{BacktestEngine, BacktestError, BacktestReport};
use crate::exchange::ExchangeError;
use crate::log_stream::LogSubscription;
use crate::oracle::OracleError;
use crate::persistence::history::DEFAULT_DOWNLOAD_LIMIT;
use crate::persistence::{CandleStore, DownloadSummary, HistoryError, LedgerError};
use crate::session::{
    ControlLoop, SessionDeps, SessionInfo, SessionRegistry, ShutdownReport, StartOutcome,
};
use crate::types::{PredictionSignal, SessionKey, Trade, UserId};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("models are not ready for user {user_id}: {reason}. Please train models first.")]
    ModelsMissing { user_id: UserId, reason: String },
    #[error("no market data returned for {0}")]
    NoData(String),
    #[error("prediction failed: {0}")]
    Oracle(#[source] OracleError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Backtest(#[from] BacktestError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

impl ServiceError {
    /// Errors caused by the request or the user's data rather than by the system
    pub fn is_client_error(&self) -> bool {
        match self {
            ServiceError::ModelsMissing { .. } | ServiceError::NoData(_) => true,
            ServiceError::Oracle(e) => e.is_data(),
            ServiceError::Backtest(BacktestError::InsufficientData { .. }) => true,
            ServiceError::Backtest(BacktestError::History(
                HistoryError::NotFound(_) | HistoryError::InvalidId(_),
            ))
            | ServiceError::History(HistoryError::NotFound(_) | HistoryError::InvalidId(_))
            | ServiceError::History(HistoryError::Empty(_)) => true,
            ServiceError::Exchange(e) => {
                matches!(e, ExchangeError::Unsupported(_) | ExchangeError::Credentials(_))
            }
            _ => false,
        }
    }
}

pub struct TradingService {
    deps: SessionDeps,
    candles: CandleStore,
    backtester: BacktestEngine,
}

impl TradingService {
    pub fn new(deps: SessionDeps, candles: CandleStore, backtester: BacktestEngine) -> Self {
        Self {
            deps,
            candles,
            backtester,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.deps.registry
    }

    /// Start a session. Already running keys are reported, not restarted.
    pub async fn start(&self, key: SessionKey, strategy: &str) -> Result<StartOutcome, ServiceError> {
        if self.deps.registry.is_running(&key) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        self.deps
            .oracle
            .ensure_ready(key.user_id)
            .await
            .map_err(|e| match e {
                OracleError::ModelMissing(reason) => ServiceError::ModelsMissing {
                    user_id: key.user_id,
                    reason,
                },
                other => ServiceError::Oracle(other),
            })?;

        let deps = self.deps.clone();
        let outcome = self
            .deps
            .registry
            .start(key.clone(), strategy, move |ticket| ControlLoop::spawn(deps, ticket));

        info!(session = %key, strategy = %strategy, outcome = ?outcome, "Start requested");
        Ok(outcome)
    }

    /// Request a stop. Returns whether the session was running.
    pub fn stop(&self, key: &SessionKey) -> bool {
        self.deps.registry.stop(key)
    }

    pub fn status(&self, key: &SessionKey) -> bool {
        self.deps.registry.is_running(key)
    }

    /// Running sessions of a user
    pub fn sessions(&self, user_id: UserId) -> Vec<SessionInfo> {
        self.deps
            .registry
            .sessions()
            .into_iter()
            .filter(|s| s.key.user_id == user_id)
            .collect()
    }

    /// Replay the decision rule over the user's stored history
    pub async fn backtest(
        &self,
        user_id: UserId,
        exchange: &str,
        symbol: &str,
    ) -> Result<BacktestReport, ServiceError> {
        let timeframe = &self.backtester.config().timeframe;
        let candles = self
            .candles
            .load(user_id, exchange, symbol, timeframe)
            .map_err(BacktestError::from)?;

        let report = self
            .backtester
            .run(self.deps.oracle.as_ref(), user_id, &candles, Utc::now())
            .await?;
        Ok(report)
    }

    /// Signal for the latest live window. Any oracle error is returned as is.
    pub async fn predict(
        &self,
        user_id: UserId,
        exchange: &str,
        symbol: &str,
    ) -> Result<PredictionSignal, ServiceError> {
        let config = &self.deps.config;
        let client = self.deps.connector.connect(user_id, exchange).await?;
        let window = client
            .fetch_candles(symbol, &config.timeframe, config.candle_limit)
            .await?;
        if window.is_empty() {
            return Err(ServiceError::NoData(symbol.to_string()));
        }

        self.deps
            .oracle
            .predict(user_id, &window)
            .await
            .map_err(ServiceError::Oracle)
    }

    /// Download candles for later backtests, reporting progress on the log stream
    pub async fn download(
        &self,
        user_id: UserId,
        exchange: &str,
        symbol: &str,
        timeframe: Option<&str>,
        limit: Option<usize>,
    ) -> Result<DownloadSummary, ServiceError> {
        let timeframe = timeframe.unwrap_or(self.backtester.config().timeframe.as_str());
        let limit = limit.unwrap_or(DEFAULT_DOWNLOAD_LIMIT);
        let logs = &self.deps.logs;

        logs.log(user_id, format!("INFO: Starting download for {}...", symbol));
        let result = async {
            let client = self.deps.connector.connect(user_id, exchange).await?;
            let summary = self
                .candles
                .download(client.as_ref(), user_id, exchange, symbol, timeframe, limit)
                .await?;
            Ok::<_, ServiceError>(summary)
        }
        .await;

        match &result {
            Ok(_) => logs.log(user_id, format!("INFO: Download completed for {}.", symbol)),
            Err(e) => logs.log(
                user_id,
                format!("ERROR: Download failed for {}: {}", symbol, e),
            ),
        }
        result
    }

    /// Trades of a user, newest first
    pub async fn trade_history(&self, user_id: UserId) -> Result<Vec<Trade>, ServiceError> {
        Ok(self.deps.ledger.history(user_id).await?)
    }

    pub fn subscribe_logs(&self, user_id: UserId) -> LogSubscription {
        self.deps.logs.register(user_id)
    }

    /// Stop every session and wait for the workers to exit
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.deps.registry.shutdown(grace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Exchange, ExchangeConnector, MockExchange};
    use crate::log_stream::LogBroadcaster;
    use crate::oracle::PredictionOracle;
    use crate::persistence::InMemoryTradeLedger;
    use crate::risk::RiskGuard;
    use crate::session::ControlLoopConfig;
    use crate::types::{Candle, TradingMode};
    use async_trait::async_trait;

    struct MissingModels;

    #[async_trait]
    impl PredictionOracle for MissingModels {
        async fn predict(
            &self,
            _user_id: UserId,
            _window: &[Candle],
        ) -> Result<PredictionSignal, OracleError> {
            Err(OracleError::FeatureMismatch("Feature mismatch for regime model. Retrain.".into()))
        }

        async fn ensure_ready(&self, _user_id: UserId) -> Result<(), OracleError> {
            Err(OracleError::ModelMissing("regime_model".into()))
        }
    }

    struct OneCandle;

    #[async_trait]
    impl ExchangeConnector for OneCandle {
        async fn connect(
            &self,
            _user_id: UserId,
            _exchange_id: &str,
        ) -> Result<Box<dyn Exchange>, ExchangeError> {
            let mut exchange = MockExchange::new();
            exchange.expect_mode().return_const(TradingMode::Paper);
            exchange.expect_fetch_candles().returning(|_, _, _| {
                Ok(vec![Candle {
                    timestamp: 0,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                }])
            });
            Ok(Box::new(exchange))
        }
    }

    fn service(data_dir: &str) -> TradingService {
        let deps = SessionDeps {
            registry: Arc::new(SessionRegistry::new()),
            connector: Arc::new(OneCandle),
            oracle: Arc::new(MissingModels),
            ledger: Arc::new(InMemoryTradeLedger::new()),
            logs: LogBroadcaster::new(16),
            guard: RiskGuard::default(),
            config: ControlLoopConfig::default(),
        };
        TradingService::new(deps, CandleStore::new(data_dir), BacktestEngine::default())
    }

    #[tokio::test]
    async fn start_is_refused_without_models() {
        let svc = service("/nonexistent");
        let key = SessionKey::new(1, "binance", "BTC/USDT");

        let err = svc.start(key.clone(), "ensemble").await.unwrap_err();
        assert!(matches!(err, ServiceError::ModelsMissing { user_id: 1, .. }));
        assert!(err.is_client_error());
        assert!(!svc.status(&key));
    }

    #[tokio::test]
    async fn one_shot_prediction_surfaces_feature_mismatch() {
        let svc = service("/nonexistent");
        let err = svc.predict(1, "binance", "BTC/USDT").await.unwrap_err();
        match err {
            ServiceError::Oracle(OracleError::FeatureMismatch(msg)) => assert!(msg.contains("Retrain")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn backtest_without_history_is_a_client_error() {
        let svc = service("/nonexistent-regimebot-data");
        let err = svc.backtest(1, "binance", "BTC/USDT").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Backtest(BacktestError::History(HistoryError::NotFound(_)))
        ));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn backtest_rejects_paths_into_other_users_data() {
        let svc = service("/nonexistent-regimebot-data");
        let err = svc.backtest(1, "../2/binance", "BTC/USDT").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Backtest(BacktestError::History(HistoryError::InvalidId(_)))
        ));
        assert!(err.is_client_error());
    }
}
