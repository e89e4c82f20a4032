//! RegimeBot Library
//!
//! Per-user automated trading sessions driven by a regime prediction oracle,
//! with a shared decision rule for live trading and backtests, a drawdown
//! circuit breaker and per-user log streams.

pub mod app;
pub mod backtesting;
pub mod config;
pub mod exchange;
pub mod features;
pub mod log_stream;
pub mod oracle;
pub mod persistence;
pub mod risk;
pub mod session;
pub mod strategy;
pub mod types;

#[cfg(feature = "api")]
pub mod api;
