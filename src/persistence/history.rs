//! Historical candle storage
//!
//! Candles downloaded for backtesting are kept as one CSV per
//! `(user, exchange, symbol, timeframe)` under
//! `{data_dir}/{user}/{exchange}_{BASE-QUOTE}_{timeframe}.csv`.

use csv::{ReaderBuilder, WriterBuilder};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::exchange::{Exchange, ExchangeError};
use crate::types::{Candle, UserId};

/// Default number of candles fetched by [`CandleStore::download`]
pub const DEFAULT_DOWNLOAD_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("no historical data at {}", .0.display())]
    NotFound(PathBuf),
    #[error("exchange returned no candles for {0}")]
    Empty(String),
    #[error("invalid series identifier '{0}'")]
    InvalidId(String),
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Result of a download
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub file_name: String,
    pub rows: usize,
}

/// CSV-backed candle store
#[derive(Debug, Clone)]
pub struct CandleStore {
    data_dir: PathBuf,
}

impl CandleStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// "binance", "BTC/USDT", "1h" -> "binance_BTC-USDT_1h.csv"
    pub fn file_name(exchange: &str, symbol: &str, timeframe: &str) -> String {
        format!("{}_{}_{}.csv", exchange, symbol.replace('/', "-"), timeframe)
    }

    /// Location of a series. Identifiers may only hold ASCII letters, digits,
    /// `-` and `_` (plus the `/` of a symbol) so a path never leaves the
    /// user's directory.
    pub fn path_for(
        &self,
        user_id: UserId,
        exchange: &str,
        symbol: &str,
        timeframe: &str,
    ) -> Result<PathBuf, HistoryError> {
        check_id(exchange)?;
        check_id(&symbol.replace('/', "-"))?;
        check_id(timeframe)?;
        Ok(self
            .data_dir
            .join(user_id.to_string())
            .join(Self::file_name(exchange, symbol, timeframe)))
    }

    /// Load stored candles, oldest first
    pub fn load(
        &self,
        user_id: UserId,
        exchange: &str,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Vec<Candle>, HistoryError> {
        let path = self.path_for(user_id, exchange, symbol, timeframe)?;
        if !path.exists() {
            return Err(HistoryError::NotFound(path));
        }
        Self::read_csv(&path)
    }

    /// Replace the stored candles of a series
    pub fn save(
        &self,
        user_id: UserId,
        exchange: &str,
        symbol: &str,
        timeframe: &str,
        candles: &[Candle],
    ) -> Result<PathBuf, HistoryError> {
        let path = self.path_for(user_id, exchange, symbol, timeframe)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = File::create(&path)?;
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);
        for candle in candles {
            writer.serialize(candle)?;
        }
        writer.flush()?;
        Ok(path)
    }

    /// Fetch the latest `limit` candles from the exchange and store them
    pub async fn download(
        &self,
        exchange: &dyn Exchange,
        user_id: UserId,
        exchange_id: &str,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<DownloadSummary, HistoryError> {
        self.path_for(user_id, exchange_id, symbol, timeframe)?;
        let candles = exchange.fetch_candles(symbol, timeframe, limit).await?;
        if candles.is_empty() {
            return Err(HistoryError::Empty(symbol.to_string()));
        }

        let path = self.save(user_id, exchange_id, symbol, timeframe, &candles)?;
        info!(
            user_id,
            symbol = %symbol,
            timeframe = %timeframe,
            rows = candles.len(),
            path = %path.display(),
            "Historical candles saved"
        );

        Ok(DownloadSummary {
            file_name: Self::file_name(exchange_id, symbol, timeframe),
            rows: candles.len(),
        })
    }

    fn read_csv(path: &Path) -> Result<Vec<Candle>, HistoryError> {
        let file = File::open(path)?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
        let mut candles = Vec::new();
        for result in reader.deserialize() {
            let candle: Candle = result?;
            candles.push(candle);
        }
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }
}

fn check_id(id: &str) -> Result<(), HistoryError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(HistoryError::InvalidId(id.to_string()))
    }
}
