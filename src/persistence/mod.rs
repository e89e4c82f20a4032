//! Persistence layer
//!
//! - `ledger`: trade records (in-memory or CSV event log)
//! - `settings`: per-user account settings
//! - `history`: downloaded candle series used by backtests

pub mod history;
pub mod ledger;
pub mod settings;

pub use history::{CandleStore, DownloadSummary, HistoryError};
pub use ledger::{CsvTradeLedger, InMemoryTradeLedger, LedgerError, TradeLedger};
pub use settings::{ApiCredentials, InMemorySettingsStore, SettingsStore, UserSettings};
