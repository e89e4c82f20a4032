//! Account drawdown circuit breaker
//!
//! Runs periodically over every user with at least one active session. When a
//! user's quote-asset balance has fallen more than their configured daily
//! drawdown limit below the baseline, every session of that user is stopped.
//! Failures for one user are logged to that user and never affect the others.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::exchange::{ExchangeConnector, ExchangeError};
use crate::log_stream::LogBroadcaster;
use crate::persistence::settings::SettingsStore;
use crate::session::SessionRegistry;
use crate::types::UserId;

/// How the reference balance is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    /// Oldest balance observed by the breaker within the lookback window
    #[default]
    Snapshot,
    /// `current * (1 + (limit + 1) / 100)`. A placeholder with no history
    /// behind it: it always reports a drawdown just above the limit.
    LimitApproximation,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub quote_asset: String,
    pub baseline: Baseline,
    pub lookback: Duration,
    pub interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            baseline: Baseline::Snapshot,
            lookback: Duration::from_secs(24 * 3600),
            interval: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("no {0} balance reported")]
    MissingQuote(String),
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakerReport {
    /// Users whose balances were checked
    pub evaluated: usize,
    pub tripped: Vec<UserId>,
    pub failed: Vec<UserId>,
}

type SnapshotKey = (UserId, String);

pub struct CircuitBreaker {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn ExchangeConnector>,
    settings: Arc<dyn SettingsStore>,
    logs: LogBroadcaster,
    config: BreakerConfig,
    snapshots: Mutex<HashMap<SnapshotKey, VecDeque<(DateTime<Utc>, f64)>>>,
}

impl CircuitBreaker {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn ExchangeConnector>,
        settings: Arc<dyn SettingsStore>,
        logs: LogBroadcaster,
        config: BreakerConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            settings,
            logs,
            config,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_once(&self) -> BreakerReport {
        self.run_once_at(Utc::now()).await
    }

    /// One pass over every active user, with `now` as the snapshot time
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> BreakerReport {
        let mut report = BreakerReport::default();
        let users = self.registry.active_users();
        debug!(users = users.len(), "Running circuit breaker check");
        self.prune_inactive();

        for user_id in users {
            let Some(settings) = self.settings.get(user_id).await else {
                continue;
            };
            report.evaluated += 1;

            match self.check_user(user_id, settings.max_daily_drawdown_pct, now).await {
                Ok(Some(drawdown_pct)) => {
                    self.logs.log(
                        user_id,
                        format!(
                            "CRITICAL: CIRCUIT BREAKER! Drawdown of {:.2}% exceeds limit. Stopping all bots.",
                            drawdown_pct
                        ),
                    );
                    let stopped = self.registry.stop_user(user_id);
                    warn!(
                        user_id,
                        drawdown_pct,
                        limit = settings.max_daily_drawdown_pct,
                        sessions = stopped.len(),
                        "Circuit breaker tripped"
                    );
                    report.tripped.push(user_id);
                }
                Ok(None) => {}
                Err(e) => {
                    self.logs.log(
                        user_id,
                        format!("JOB-ERROR: Circuit breaker check failed: {}", e),
                    );
                    warn!(user_id, error = %e, "Circuit breaker check failed");
                    report.failed.push(user_id);
                }
            }
        }

        report
    }

    /// Drawdown that breached the limit on any of the user's exchanges
    async fn check_user(
        &self,
        user_id: UserId,
        limit_pct: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>, BreakerError> {
        for exchange_id in self.registry.user_exchanges(user_id) {
            let exchange = self.connector.connect(user_id, &exchange_id).await?;
            let balances = exchange.fetch_balance().await?;
            // an absent quote asset after a recorded balance means it was drained
            let current = match balances.get(&self.config.quote_asset) {
                Some(balance) => *balance,
                None if self.has_snapshot(user_id, &exchange_id) => 0.0,
                None => return Err(BreakerError::MissingQuote(self.config.quote_asset.clone())),
            };

            let Some(baseline) = self.baseline(user_id, &exchange_id, current, limit_pct, now)
            else {
                continue;
            };
            if baseline <= 0.0 {
                continue;
            }

            let drawdown_pct = drawdown_pct(baseline, current);
            debug!(
                user_id,
                exchange = %exchange_id,
                current,
                baseline,
                drawdown_pct,
                "Drawdown evaluated"
            );
            if drawdown_pct > limit_pct {
                return Ok(Some(drawdown_pct));
            }
        }
        Ok(None)
    }

    fn has_snapshot(&self, user_id: UserId, exchange_id: &str) -> bool {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user_id, exchange_id.to_string()))
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }

    /// Forget balances of `(user, exchange)` pairs with no running session
    fn prune_inactive(&self) {
        let active: HashSet<SnapshotKey> = self
            .registry
            .active_keys()
            .into_iter()
            .map(|k| (k.user_id, k.exchange))
            .collect();
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|key, _| active.contains(key));
    }

    fn baseline(
        &self,
        user_id: UserId,
        exchange_id: &str,
        current: f64,
        limit_pct: f64,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        match self.config.baseline {
            Baseline::LimitApproximation => Some(current * (1.0 + (limit_pct + 1.0) / 100.0)),
            Baseline::Snapshot => {
                let lookback = chrono::Duration::from_std(self.config.lookback)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
                let cutoff = now - lookback;

                let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
                let history = snapshots
                    .entry((user_id, exchange_id.to_string()))
                    .or_default();
                while history.front().map(|(at, _)| *at < cutoff).unwrap_or(false) {
                    history.pop_front();
                }
                let baseline = history.front().map(|(_, balance)| *balance);
                history.push_back((now, current));
                baseline
            }
        }
    }

    /// Run [`Self::run_once`] every `config.interval`, first run one interval from now
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            info!(interval_secs = period.as_secs(), "Circuit breaker scheduled");
            loop {
                ticker.tick().await;
                let report = self.run_once().await;
                if !report.tripped.is_empty() || !report.failed.is_empty() {
                    info!(
                        evaluated = report.evaluated,
                        tripped = ?report.tripped,
                        failed = ?report.failed,
                        "Circuit breaker pass finished"
                    );
                }
            }
        })
    }
}

/// `(baseline - current) / baseline * 100`
pub fn drawdown_pct(baseline: f64, current: f64) -> f64 {
    (baseline - current) / baseline * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Balances, Exchange, MockExchange};
    use crate::persistence::settings::{InMemorySettingsStore, UserSettings};
    use crate::session::WorkerExit;
    use crate::types::{SessionKey, TradingMode};
    use async_trait::async_trait;

    /// Per-user balances, or a failing exchange when `None`
    struct BalanceConnector(Mutex<HashMap<UserId, Option<Balances>>>);

    impl BalanceConnector {
        fn set(&self, user_id: UserId, usdt: Option<f64>) {
            let balances = usdt.map(|b| Balances::from([("USDT".to_string(), b)]));
            self.set_balances(user_id, balances);
        }

        fn set_balances(&self, user_id: UserId, balances: Option<Balances>) {
            self.0.lock().unwrap().insert(user_id, balances);
        }
    }

    #[async_trait]
    impl ExchangeConnector for BalanceConnector {
        async fn connect(
            &self,
            user_id: UserId,
            _exchange_id: &str,
        ) -> Result<Box<dyn Exchange>, ExchangeError> {
            let balances = self.0.lock().unwrap().get(&user_id).cloned().flatten();
            let mut exchange = MockExchange::new();
            exchange.expect_mode().return_const(TradingMode::Paper);
            exchange.expect_fetch_balance().returning(move || match &balances {
                Some(b) => Ok(b.clone()),
                None => Err(ExchangeError::Network("timeout".into())),
            });
            Ok(Box::new(exchange))
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        connector: Arc<BalanceConnector>,
        logs: LogBroadcaster,
        breaker: CircuitBreaker,
    }

    fn fixture(baseline: Baseline) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let connector = Arc::new(BalanceConnector(Mutex::new(HashMap::new())));
        let settings = Arc::new(InMemorySettingsStore::with_users([
            (1, UserSettings::default()),
            (2, UserSettings::default()),
        ]));
        let logs = LogBroadcaster::new(16);
        let breaker = CircuitBreaker::new(
            Arc::clone(&registry),
            connector.clone(),
            settings,
            logs.clone(),
            BreakerConfig {
                baseline,
                ..BreakerConfig::default()
            },
        );
        Fixture {
            registry,
            connector,
            logs,
            breaker,
        }
    }

    fn run_session(registry: &SessionRegistry, user_id: UserId, symbol: &str) -> SessionKey {
        let key = SessionKey::new(user_id, "binance", symbol);
        registry.start(key.clone(), "ensemble", |ticket| {
            tokio::spawn(async move {
                ticket.stopped().await;
                WorkerExit::Stopped
            })
        });
        key
    }

    fn at(hour: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + chrono::Duration::hours(hour)
    }

    #[test]
    fn test_drawdown_formula() {
        assert!((drawdown_pct(1000.0, 900.0) - 10.0).abs() < 1e-9);
        assert!(drawdown_pct(1000.0, 1100.0) < 0.0);
    }

    #[tokio::test]
    async fn test_trips_only_the_offending_user() {
        let f = fixture(Baseline::Snapshot);
        let a1 = run_session(&f.registry, 1, "BTC/USDT");
        let a2 = run_session(&f.registry, 1, "ETH/USDT");
        let b1 = run_session(&f.registry, 2, "BTC/USDT");
        let mut alice_logs = f.logs.register(1);
        let mut bob_logs = f.logs.register(2);

        f.connector.set(1, Some(1000.0));
        f.connector.set(2, Some(1000.0));
        let first = f.breaker.run_once_at(at(0)).await;
        assert_eq!(first.evaluated, 2);
        assert!(first.tripped.is_empty());

        // alice loses 10% (limit 5%), bob 1%
        f.connector.set(1, Some(900.0));
        f.connector.set(2, Some(990.0));
        let second = f.breaker.run_once_at(at(1)).await;
        assert_eq!(second.tripped, vec![1]);

        assert!(!f.registry.is_running(&a1));
        assert!(!f.registry.is_running(&a2));
        assert!(f.registry.is_running(&b1));

        let line = alice_logs.try_recv().unwrap();
        assert_eq!(
            line.message,
            "CRITICAL: CIRCUIT BREAKER! Drawdown of 10.00% exceeds limit. Stopping all bots."
        );
        assert!(bob_logs.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_no_trip_without_history() {
        let f = fixture(Baseline::Snapshot);
        let key = run_session(&f.registry, 1, "BTC/USDT");
        f.connector.set(1, Some(10.0));

        let report = f.breaker.run_once_at(at(0)).await;
        assert!(report.tripped.is_empty());
        assert!(f.registry.is_running(&key));
    }

    #[tokio::test]
    async fn test_snapshots_expire_after_lookback() {
        let f = fixture(Baseline::Snapshot);
        let key = run_session(&f.registry, 1, "BTC/USDT");

        f.connector.set(1, Some(1000.0));
        f.breaker.run_once_at(at(0)).await;
        f.connector.set(1, Some(960.0));
        f.breaker.run_once_at(at(20)).await;

        // 30h later the 1000 snapshot is outside the window; 960 -> 930 is 3.1%
        f.connector.set(1, Some(930.0));
        let report = f.breaker.run_once_at(at(30)).await;
        assert!(report.tripped.is_empty());
        assert!(f.registry.is_running(&key));
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_user() {
        let f = fixture(Baseline::Snapshot);
        run_session(&f.registry, 1, "BTC/USDT");
        let b1 = run_session(&f.registry, 2, "BTC/USDT");
        let mut alice_logs = f.logs.register(1);

        f.connector.set(1, None);
        f.connector.set(2, Some(1000.0));
        f.breaker.run_once_at(at(0)).await;
        f.connector.set(2, Some(500.0));
        let report = f.breaker.run_once_at(at(1)).await;

        assert_eq!(report.failed, vec![1]);
        assert_eq!(report.tripped, vec![2]);
        assert!(!f.registry.is_running(&b1));
        assert!(alice_logs
            .try_recv()
            .unwrap()
            .message
            .starts_with("JOB-ERROR: Circuit breaker check failed"));
    }

    #[tokio::test]
    async fn test_limit_approximation_always_trips() {
        let f = fixture(Baseline::LimitApproximation);
        let key = run_session(&f.registry, 1, "BTC/USDT");
        f.connector.set(1, Some(1000.0));

        let report = f.breaker.run_once_at(at(0)).await;
        assert_eq!(report.tripped, vec![1]);
        assert!(!f.registry.is_running(&key));
    }

    #[tokio::test]
    async fn test_users_without_settings_are_skipped() {
        let f = fixture(Baseline::LimitApproximation);
        let key = run_session(&f.registry, 3, "BTC/USDT");
        f.connector.set(3, Some(1000.0));

        let report = f.breaker.run_once_at(at(0)).await;
        assert_eq!(report.evaluated, 0);
        assert!(f.registry.is_running(&key));
    }

    #[tokio::test]
    async fn test_drained_quote_balance_trips() {
        let f = fixture(Baseline::Snapshot);
        let key = run_session(&f.registry, 1, "BTC/USDT");
        let mut logs = f.logs.register(1);

        f.connector.set(1, Some(1000.0));
        assert!(f.breaker.run_once_at(at(0)).await.tripped.is_empty());

        // the exchange no longer lists the quote asset at all
        f.connector.set_balances(1, Some(Balances::new()));
        let report = f.breaker.run_once_at(at(1)).await;

        assert_eq!(report.tripped, vec![1]);
        assert!(report.failed.is_empty());
        assert!(!f.registry.is_running(&key));
        assert_eq!(
            logs.try_recv().unwrap().message,
            "CRITICAL: CIRCUIT BREAKER! Drawdown of 100.00% exceeds limit. Stopping all bots."
        );
    }

    #[tokio::test]
    async fn test_missing_quote_without_history_is_a_job_error() {
        let f = fixture(Baseline::Snapshot);
        let key = run_session(&f.registry, 1, "BTC/USDT");
        f.connector.set_balances(1, Some(Balances::new()));

        let report = f.breaker.run_once_at(at(0)).await;
        assert_eq!(report.failed, vec![1]);
        assert!(f.registry.is_running(&key));
    }

    #[tokio::test]
    async fn test_snapshots_of_stopped_sessions_are_dropped() {
        let f = fixture(Baseline::Snapshot);
        let a = run_session(&f.registry, 1, "BTC/USDT");
        run_session(&f.registry, 2, "BTC/USDT");
        f.connector.set(1, Some(1000.0));
        f.connector.set(2, Some(1000.0));
        f.breaker.run_once_at(at(0)).await;
        assert_eq!(f.breaker.snapshots.lock().unwrap().len(), 2);

        f.registry.stop(&a);
        f.breaker.run_once_at(at(1)).await;

        let snapshots = f.breaker.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots.contains_key(&(2, "binance".to_string())));
    }
}
