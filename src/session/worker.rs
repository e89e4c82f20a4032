//! Per-session control loop
//!
//! One tokio task per session key. Each cycle fetches a candle window, checks
//! the ATR stop of a held position, asks the oracle for a signal and applies
//! the shared decision rule. Cycles are strictly sequential; the task exits
//! as soon as the registry no longer lists it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{timing, SessionRegistry, WorkerTicket};
use crate::exchange::{Exchange, ExchangeConnector, ExchangeError};
use crate::features::IndicatorSnapshot;
use crate::log_stream::LogBroadcaster;
use crate::oracle::{OracleError, PredictionOracle};
use crate::persistence::ledger::{LedgerError, TradeLedger};
use crate::risk::{ExitReason, RiskGuard};
use crate::strategy::{decide, stop_loss_exit, Action, OpenPosition, PositionState};

/// Control loop timing and data parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ControlLoopConfig {
    pub timeframe: String,
    /// Candles fetched per cycle
    pub candle_limit: usize,
    /// Added after each candle boundary so the new candle is published
    pub candle_buffer: Duration,
    pub min_sleep: Duration,
    /// Used when the timeframe cannot be parsed
    pub fallback_interval: Duration,
    pub empty_data_backoff: Duration,
    pub error_backoff: Duration,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            timeframe: "1h".to_string(),
            candle_limit: 200,
            candle_buffer: Duration::from_secs(5),
            min_sleep: Duration::from_secs(5),
            fallback_interval: Duration::from_secs(900),
            empty_data_backoff: Duration::from_secs(60),
            error_backoff: Duration::from_secs(60),
        }
    }
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The session was removed from the registry
    Stopped,
    /// A fatal error ended the session
    Failed(String),
}

/// Collaborators shared by every session worker
#[derive(Clone)]
pub struct SessionDeps {
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn ExchangeConnector>,
    pub oracle: Arc<dyn PredictionOracle>,
    pub ledger: Arc<dyn TradeLedger>,
    pub logs: LogBroadcaster,
    pub guard: RiskGuard,
    pub config: ControlLoopConfig,
}

/// Outcome of a failed cycle
#[derive(Debug)]
enum CycleError {
    /// Retry after the error backoff
    Transient(String),
    /// Skip this candle
    Data(String),
    /// End the session
    Fatal(String),
}

impl From<ExchangeError> for CycleError {
    fn from(e: ExchangeError) -> Self {
        if e.is_transient() {
            CycleError::Transient(e.to_string())
        } else {
            CycleError::Fatal(e.to_string())
        }
    }
}

impl From<OracleError> for CycleError {
    fn from(e: OracleError) -> Self {
        if e.is_data() {
            CycleError::Data(e.to_string())
        } else if e.is_transient() {
            CycleError::Transient(e.to_string())
        } else {
            CycleError::Fatal(e.to_string())
        }
    }
}

impl From<LedgerError> for CycleError {
    fn from(e: LedgerError) -> Self {
        CycleError::Fatal(format!("trade ledger: {}", e))
    }
}

/// Removes the session from the registry when the worker ends, panics included
struct MembershipGuard {
    registry: Arc<SessionRegistry>,
    ticket: WorkerTicket,
}

impl Drop for MembershipGuard {
    fn drop(&mut self) {
        self.registry
            .remove_if_current(&self.ticket.key, self.ticket.generation);
    }
}

pub struct ControlLoop {
    deps: SessionDeps,
    ticket: WorkerTicket,
    position: PositionState,
    prefix: String,
}

impl ControlLoop {
    pub fn new(deps: SessionDeps, ticket: WorkerTicket) -> Self {
        Self {
            deps,
            ticket,
            position: PositionState::default(),
            prefix: String::new(),
        }
    }

    /// Spawn the loop on the current runtime
    pub fn spawn(deps: SessionDeps, ticket: WorkerTicket) -> JoinHandle<WorkerExit> {
        tokio::spawn(Self::new(deps, ticket).run())
    }

    pub async fn run(mut self) -> WorkerExit {
        let _membership = MembershipGuard {
            registry: Arc::clone(&self.deps.registry),
            ticket: self.ticket.clone(),
        };
        let key = self.ticket.key.clone();

        let exit = match self.deps.connector.connect(key.user_id, &key.exchange).await {
            Ok(exchange) => {
                self.prefix = format!("[{} - {}] ", key.symbol, exchange.mode());
                self.log(format!(
                    "INFO: Bot started with strategy '{}' on {}.",
                    self.ticket.strategy, self.deps.config.timeframe
                ));
                self.drive(exchange.as_ref()).await
            }
            Err(e) => {
                self.deps
                    .logs
                    .log(key.user_id, format!("FATAL: Bot init error: {}", e));
                WorkerExit::Failed(e.to_string())
            }
        };

        match &exit {
            WorkerExit::Stopped => tracing::info!(session = %key, "Session worker stopped"),
            WorkerExit::Failed(reason) => {
                tracing::error!(session = %key, reason = %reason, "Session worker failed")
            }
        }
        self.deps
            .registry
            .remove_if_current(&key, self.ticket.generation);
        self.deps
            .logs
            .log(key.user_id, format!("INFO: Bot for {} stopped.", key.symbol));
        exit
    }

    async fn drive(&mut self, exchange: &dyn Exchange) -> WorkerExit {
        loop {
            if !self
                .deps
                .registry
                .is_current(&self.ticket.key, self.ticket.generation)
            {
                self.log("INFO: Stop requested. Exiting.");
                return WorkerExit::Stopped;
            }

            let pause = match self.cycle(exchange).await {
                Ok(pause) => pause,
                Err(CycleError::Transient(msg)) => {
                    self.log(format!("WARN: Net/Exch Error: {}. Retrying.", msg));
                    self.deps.config.error_backoff
                }
                Err(CycleError::Data(msg)) => {
                    self.log(format!("WARN: Prediction skipped: {}.", msg));
                    self.until_next_candle()
                }
                Err(CycleError::Fatal(msg)) => {
                    self.log(format!("FATAL: Bot loop error: {}", msg));
                    return WorkerExit::Failed(msg);
                }
            };

            self.pause(pause).await;
        }
    }

    /// One pass of the decision cycle. Returns how long to sleep afterwards.
    async fn cycle(&mut self, exchange: &dyn Exchange) -> Result<Duration, CycleError> {
        let config = &self.deps.config;
        let candles = exchange
            .fetch_candles(&self.ticket.key.symbol, &config.timeframe, config.candle_limit)
            .await?;

        let Some(snapshot) =
            IndicatorSnapshot::compute(&candles, self.deps.guard.config().atr_period)
        else {
            self.log("WARN: No OHLCV data. Retrying.");
            return Ok(self.deps.config.empty_data_backoff);
        };
        let price = snapshot.price;

        if let (Some(position), Some(atr)) = (self.position.position().copied(), snapshot.atr) {
            let stop = self.deps.guard.stop_for(position.entry_price, atr);
            self.log(format!(
                "INFO: Pos held. Entry:${:.4}, Curr:${:.4}, SL:${:.4}",
                position.entry_price, price, stop
            ));
            if let Some(Action::StopLoss { price, .. }) =
                stop_loss_exit(&position, price, atr, &self.deps.guard)
            {
                self.log(format!("ACTION: STOP-LOSS @ ${:.4}. Selling.", price));
                self.close_position(price, ExitReason::StopLoss).await?;
                return Ok(self.until_next_candle());
            }
        }

        let signal = self
            .deps
            .oracle
            .predict(self.ticket.key.user_id, &candles)
            .await?;
        self.log(format!("PRED: {}", signal));

        match decide(self.position.is_held(), price, signal, &self.deps.guard) {
            Action::Buy { price, size } => {
                self.log(format!("ACTION: BUY signal. Sizing to ${:.2}.", size));
                let reason = format!("Ensemble BUY @ {:.1}%", signal.confidence * 100.0);
                let trade_id = self
                    .deps
                    .ledger
                    .open(
                        self.ticket.key.user_id,
                        &self.ticket.key.symbol,
                        price,
                        size,
                        &reason,
                    )
                    .await?;
                self.position.open(OpenPosition {
                    trade_id,
                    entry_price: price,
                    size,
                });
            }
            Action::Sell { price } => {
                self.log("ACTION: SELL signal. Closing position.");
                self.close_position(price, ExitReason::Signal).await?;
            }
            Action::StopLoss { .. } | Action::Hold => {}
        }

        Ok(self.until_next_candle())
    }

    async fn close_position(&mut self, price: f64, reason: ExitReason) -> Result<(), CycleError> {
        if let Some(trade_id) = self.position.active_trade_id() {
            let trade = self.deps.ledger.close(trade_id, price).await?;
            tracing::info!(
                session = %self.ticket.key,
                trade_id,
                reason = %reason,
                pnl_pct = trade.profit_loss_pct.unwrap_or_default(),
                "Position closed"
            );
        }
        self.position.close();
        Ok(())
    }

    fn until_next_candle(&self) -> Duration {
        timing::sleep_duration(
            &self.deps.config.timeframe,
            Utc::now().timestamp(),
            &self.deps.config,
        )
    }

    /// Sleep, waking early if the session is stopped
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.ticket.stopped() => {}
        }
    }

    fn log(&self, message: impl AsRef<str>) {
        self.deps.logs.log(
            self.ticket.key.user_id,
            format!("{}{}", self.prefix, message.as_ref()),
        );
    }
}
