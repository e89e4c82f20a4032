//! Backtest tests over stored history

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use regimebot::app::{ServiceError, TradingService};
    use regimebot::backtesting::{BacktestConfig, BacktestEngine};
    use regimebot::exchange::{Balances, Exchange, ExchangeConnector, ExchangeError};
    use regimebot::log_stream::LogBroadcaster;
    use regimebot::oracle::{OracleError, PredictionOracle};
    use regimebot::persistence::{CandleStore, InMemoryTradeLedger};
    use regimebot::risk::RiskGuard;
    use regimebot::session::{ControlLoopConfig, SessionDeps, SessionRegistry};
    use regimebot::types::{Candle, PredictionSignal, TradingMode, UserId};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    /// Buy when the last close rose, sell otherwise
    struct MomentumOracle;

    #[async_trait]
    impl PredictionOracle for MomentumOracle {
        async fn predict(
            &self,
            _user_id: UserId,
            window: &[Candle],
        ) -> Result<PredictionSignal, OracleError> {
            match window {
                [.., prev, last] if last.close > prev.close => {
                    Ok(PredictionSignal::new(1, 0.8).unwrap())
                }
                [.., _, _] => Ok(PredictionSignal::new(0, 0.8).unwrap()),
                _ => Err(OracleError::FeatureMismatch("window too short".into())),
            }
        }
    }

    fn wave(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + 10.0 * (i as f64 / 5.0).sin();
                Candle {
                    timestamp: 1_700_000_000_000 + i as i64 * 3_600_000,
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 100.0,
                }
            })
            .collect()
    }

    struct WaveExchange;

    #[async_trait]
    impl Exchange for WaveExchange {
        fn mode(&self) -> TradingMode {
            TradingMode::Paper
        }

        async fn fetch_candles(
            &self,
            _symbol: &str,
            _timeframe: &str,
            limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(wave(limit.min(120)))
        }

        async fn fetch_balance(&self) -> Result<Balances, ExchangeError> {
            Ok(Balances::new())
        }
    }

    struct WaveConnector;

    #[async_trait]
    impl ExchangeConnector for WaveConnector {
        async fn connect(
            &self,
            _user_id: UserId,
            exchange_id: &str,
        ) -> Result<Box<dyn Exchange>, ExchangeError> {
            if exchange_id == "binance" {
                Ok(Box::new(WaveExchange))
            } else {
                Err(ExchangeError::Unsupported(exchange_id.to_string()))
            }
        }
    }

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "regimebot_backtest_{}_{}_{}",
            test_name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    fn service(data_dir: &PathBuf) -> TradingService {
        let deps = SessionDeps {
            registry: Arc::new(SessionRegistry::new()),
            connector: Arc::new(WaveConnector),
            oracle: Arc::new(MomentumOracle),
            ledger: Arc::new(InMemoryTradeLedger::new()),
            logs: LogBroadcaster::new(64),
            guard: RiskGuard::default(),
            config: ControlLoopConfig::default(),
        };
        TradingService::new(deps, CandleStore::new(data_dir), BacktestEngine::default())
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let engine = BacktestEngine::new(
            BacktestConfig {
                warmup_bars: 20,
                ..Default::default()
            },
            RiskGuard::default(),
        );
        let candles = wave(200);
        let origin = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let first = engine.run(&MomentumOracle, 1, &candles, origin).await.unwrap();
        let second = engine.run(&MomentumOracle, 1, &candles, origin).await.unwrap();

        assert_eq!(first, second);
        assert!(first.trade_count > 1);
        assert_eq!(first.equity_curve.len(), first.returns.len());
        assert_eq!(first.equity_curve[0].timestamp, "2024-06-01 12:00");
        assert!(first.win_rate_pct >= 0.0 && first.win_rate_pct <= 100.0);
    }

    #[tokio::test]
    async fn test_download_then_backtest() {
        let dir = temp_data_dir("download");
        let svc = service(&dir);
        let mut logs = svc.subscribe_logs(4);

        let summary = assert_ok!(svc.download(4, "binance", "BTC/USDT", None, Some(100)).await);
        assert_eq!(summary.rows, 100);
        assert_eq!(summary.file_name, "binance_BTC-USDT_1h.csv");
        assert!(dir.join("4").join("binance_BTC-USDT_1h.csv").exists());

        assert_eq!(
            logs.try_recv().unwrap().message,
            "INFO: Starting download for BTC/USDT..."
        );
        assert_eq!(
            logs.try_recv().unwrap().message,
            "INFO: Download completed for BTC/USDT."
        );

        let report = assert_ok!(svc.backtest(4, "binance", "BTC/USDT").await);
        assert!(report.trade_count > 0);
        assert_eq!(report.equity_curve.len(), report.returns.len());

        // another user's history is separate
        let err = assert_err!(svc.backtest(5, "binance", "BTC/USDT").await);
        assert!(err.is_client_error());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_short_history_is_a_client_error() {
        let dir = temp_data_dir("short");
        let svc = service(&dir);

        assert_ok!(svc.download(1, "binance", "ETH/USDT", Some("1h"), Some(10)).await);
        let err = assert_err!(svc.backtest(1, "binance", "ETH/USDT").await);
        assert!(matches!(err, ServiceError::Backtest(_)));
        assert!(err.is_client_error());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_failed_download_is_logged() {
        let dir = temp_data_dir("failed");
        let svc = service(&dir);
        let mut logs = svc.subscribe_logs(2);

        let err = svc
            .download(2, "kraken", "BTC/USDT", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Exchange(ExchangeError::Unsupported(_))));

        logs.try_recv().unwrap();
        let line = logs.try_recv().unwrap().message;
        assert!(line.starts_with("ERROR: Download failed for BTC/USDT:"), "{}", line);
    }
}
