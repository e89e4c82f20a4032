//! RegimeBot server
//!
//! Usage: cargo run --features api
//!
//! Loads configuration, wires the collaborators and serves the HTTP API until
//! Ctrl-C, then stops every session.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use regimebot::api::create_router;
use regimebot::app::TradingService;
use regimebot::backtesting::BacktestEngine;
use regimebot::config::{AppConfig, LedgerKind, LogSettings};
use regimebot::exchange::BinanceConnector;
use regimebot::log_stream::LogBroadcaster;
use regimebot::oracle::HttpOracle;
use regimebot::persistence::{
    CandleStore, CsvTradeLedger, InMemorySettingsStore, InMemoryTradeLedger, TradeLedger,
};
use regimebot::risk::circuit_breaker::CircuitBreaker;
use regimebot::risk::RiskGuard;
use regimebot::session::{ControlLoopConfig, SessionDeps, SessionRegistry};

fn init_tracing(settings: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter));
    let layer = if settings.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.log)?;

    info!("Starting RegimeBot v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %config.digest(), "Configuration loaded");

    let settings = Arc::new(InMemorySettingsStore::with_users(
        config.users.iter().map(|u| (u.id, u.settings.clone())),
    ));
    let connector = Arc::new(BinanceConnector::new(
        settings.clone(),
        config.exchange.clone(),
    )?);
    let oracle = Arc::new(HttpOracle::new(
        config.oracle.base_url.clone(),
        Duration::from_secs(config.oracle.timeout_secs),
    )?);
    let ledger: Arc<dyn TradeLedger> = match config.persistence.ledger {
        LedgerKind::Csv => {
            let ledger = CsvTradeLedger::open_dir(&config.persistence.data_dir)
                .context("Failed to open trade ledger")?;
            info!(path = %ledger.path().display(), "Trade ledger opened");
            Arc::new(ledger)
        }
        LedgerKind::Memory => {
            warn!("Using in-memory trade ledger; trades are lost on exit");
            Arc::new(InMemoryTradeLedger::new())
        }
    };

    let logs = LogBroadcaster::new(config.server.log_channel_capacity);
    let registry = Arc::new(SessionRegistry::new());

    let deps = SessionDeps {
        registry: registry.clone(),
        connector: connector.clone(),
        oracle,
        ledger,
        logs: logs.clone(),
        guard: RiskGuard::new(config.risk.clone()),
        config: ControlLoopConfig::from(&config.engine),
    };
    let service = Arc::new(TradingService::new(
        deps,
        CandleStore::new(&config.persistence.data_dir),
        BacktestEngine::new(config.backtest.clone(), RiskGuard::new(config.risk.clone())),
    ));

    let breaker = config.circuit_breaker.enabled.then(|| {
        Arc::new(CircuitBreaker::new(
            registry.clone(),
            connector.clone(),
            settings.clone(),
            logs.clone(),
            (&config.circuit_breaker).into(),
        ))
        .spawn_periodic()
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("API listening on http://{}", config.server.bind);

    axum::serve(listener, create_router(service.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("API server failed")?;

    if let Some(handle) = breaker {
        handle.abort();
    }
    let report = service
        .shutdown(Duration::from_secs(config.engine.shutdown_grace_secs))
        .await;
    info!(
        stopped = report.stopped,
        joined = report.joined,
        aborted = report.aborted,
        "RegimeBot stopped"
    );

    Ok(())
}
