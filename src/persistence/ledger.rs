//! Trade ledger
//!
//! Records positions opened and closed by the control loop. A trade is
//! immutable once closed.
//!
//! The CSV ledger is an append-only event log (`OPEN` and `CLOSE` rows) that is
//! replayed into memory when the ledger is opened, so ids stay unique across
//! restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::types::{profit_loss_pct, Trade, TradeId, UserId};

/// Ledger failures. All of them are fatal for a control loop.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("trade {0} not found")]
    NotFound(TradeId),
    #[error("trade {0} is already closed")]
    AlreadyClosed(TradeId),
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Record a new open trade and return its id
    async fn open(
        &self,
        user_id: UserId,
        symbol: &str,
        entry_price: f64,
        size: f64,
        reason: &str,
    ) -> Result<TradeId, LedgerError>;

    /// Finalize a trade at `exit_price`, computing its percentage P&L
    async fn close(&self, trade_id: TradeId, exit_price: f64) -> Result<Trade, LedgerError>;

    /// All trades of a user, newest first
    async fn history(&self, user_id: UserId) -> Result<Vec<Trade>, LedgerError>;
}

/// In-memory trade table shared by both ledgers
#[derive(Debug, Default)]
struct TradeBook {
    trades: HashMap<TradeId, Trade>,
    next_id: TradeId,
}

impl TradeBook {
    fn new() -> Self {
        Self {
            trades: HashMap::new(),
            next_id: 1,
        }
    }

    fn new_trade(
        &self,
        user_id: UserId,
        symbol: &str,
        entry_price: f64,
        size: f64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Trade {
        Trade {
            id: self.next_id,
            user_id,
            symbol: symbol.to_string(),
            entry_price,
            entry_time: at,
            entry_reason: reason.to_string(),
            size,
            exit_price: None,
            exit_time: None,
            profit_loss_pct: None,
        }
    }

    fn insert(&mut self, trade: Trade) {
        self.next_id = self.next_id.max(trade.id + 1);
        self.trades.insert(trade.id, trade);
    }

    /// Closed copy of a trade, without committing it
    fn closed(&self, trade_id: TradeId, exit_price: f64, at: DateTime<Utc>) -> Result<Trade, LedgerError> {
        let trade = self
            .trades
            .get(&trade_id)
            .ok_or(LedgerError::NotFound(trade_id))?;
        if trade.is_closed() {
            return Err(LedgerError::AlreadyClosed(trade_id));
        }
        let mut closed = trade.clone();
        closed.exit_price = Some(exit_price);
        closed.exit_time = Some(at);
        closed.profit_loss_pct = Some(profit_loss_pct(trade.entry_price, exit_price));
        Ok(closed)
    }

    fn history(&self, user_id: UserId) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .trades
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.entry_time.cmp(&a.entry_time).then(b.id.cmp(&a.id)));
        trades
    }
}

/// Ledger kept in process memory only
#[derive(Debug)]
pub struct InMemoryTradeLedger {
    book: Mutex<TradeBook>,
}

impl InMemoryTradeLedger {
    pub fn new() -> Self {
        Self {
            book: Mutex::new(TradeBook::new()),
        }
    }
}

impl Default for InMemoryTradeLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeLedger for InMemoryTradeLedger {
    async fn open(
        &self,
        user_id: UserId,
        symbol: &str,
        entry_price: f64,
        size: f64,
        reason: &str,
    ) -> Result<TradeId, LedgerError> {
        let mut book = self.book.lock().await;
        let trade = book.new_trade(user_id, symbol, entry_price, size, reason, Utc::now());
        let id = trade.id;
        book.insert(trade);
        Ok(id)
    }

    async fn close(&self, trade_id: TradeId, exit_price: f64) -> Result<Trade, LedgerError> {
        let mut book = self.book.lock().await;
        let closed = book.closed(trade_id, exit_price, Utc::now())?;
        book.insert(closed.clone());
        Ok(closed)
    }

    async fn history(&self, user_id: UserId) -> Result<Vec<Trade>, LedgerError> {
        Ok(self.book.lock().await.history(user_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum EventKind {
    Open,
    Close,
}

/// One row of the ledger file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEvent {
    event: EventKind,
    trade_id: TradeId,
    user_id: UserId,
    symbol: String,
    price: f64,
    size: f64,
    reason: String,
    timestamp: DateTime<Utc>,
}

impl LedgerEvent {
    fn opened(trade: &Trade) -> Self {
        Self {
            event: EventKind::Open,
            trade_id: trade.id,
            user_id: trade.user_id,
            symbol: trade.symbol.clone(),
            price: trade.entry_price,
            size: trade.size,
            reason: trade.entry_reason.clone(),
            timestamp: trade.entry_time,
        }
    }

    fn closed(trade: &Trade, exit_price: f64, at: DateTime<Utc>) -> Self {
        Self {
            event: EventKind::Close,
            trade_id: trade.id,
            user_id: trade.user_id,
            symbol: trade.symbol.clone(),
            price: exit_price,
            size: trade.size,
            reason: String::new(),
            timestamp: at,
        }
    }
}

struct CsvInner {
    book: TradeBook,
    writer: csv::Writer<File>,
}

/// Ledger persisted as an append-only CSV event log
pub struct CsvTradeLedger {
    path: PathBuf,
    inner: Mutex<CsvInner>,
}

impl CsvTradeLedger {
    pub const FILE_NAME: &'static str = "trades.csv";

    /// Open (or create) `{data_dir}/trades.csv` and replay its events
    pub fn open_dir(data_dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(Self::FILE_NAME);

        let book = Self::replay(&path)?;
        let writer = Self::create_writer(&path)?;

        info!(
            path = %path.display(),
            trades = book.trades.len(),
            next_id = book.next_id,
            "Trade ledger loaded"
        );

        Ok(Self {
            path,
            inner: Mutex::new(CsvInner { book, writer }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_writer(path: &Path) -> Result<csv::Writer<File>, LedgerError> {
        let file_has_data =
            path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file))
    }

    fn replay(path: &Path) -> Result<TradeBook, LedgerError> {
        let mut book = TradeBook::new();
        if !path.exists() {
            return Ok(book);
        }

        let file = File::open(path)?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
        for result in reader.deserialize() {
            let event: LedgerEvent = result?;
            match event.event {
                EventKind::Open => {
                    let mut trade = book.new_trade(
                        event.user_id,
                        &event.symbol,
                        event.price,
                        event.size,
                        &event.reason,
                        event.timestamp,
                    );
                    trade.id = event.trade_id;
                    book.insert(trade);
                }
                EventKind::Close => {
                    let closed = book.closed(event.trade_id, event.price, event.timestamp)?;
                    book.insert(closed);
                }
            }
        }
        debug!(path = %path.display(), "Replayed trade ledger");
        Ok(book)
    }

    fn append(writer: &mut csv::Writer<File>, event: &LedgerEvent) -> Result<(), LedgerError> {
        writer.serialize(event)?;
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl TradeLedger for CsvTradeLedger {
    async fn open(
        &self,
        user_id: UserId,
        symbol: &str,
        entry_price: f64,
        size: f64,
        reason: &str,
    ) -> Result<TradeId, LedgerError> {
        let mut inner = self.inner.lock().await;
        let trade = inner
            .book
            .new_trade(user_id, symbol, entry_price, size, reason, Utc::now());
        Self::append(&mut inner.writer, &LedgerEvent::opened(&trade))?;
        let id = trade.id;
        inner.book.insert(trade);
        Ok(id)
    }

    async fn close(&self, trade_id: TradeId, exit_price: f64) -> Result<Trade, LedgerError> {
        let mut inner = self.inner.lock().await;
        let at = Utc::now();
        let closed = inner.book.closed(trade_id, exit_price, at)?;
        Self::append(&mut inner.writer, &LedgerEvent::closed(&closed, exit_price, at))?;
        inner.book.insert(closed.clone());
        Ok(closed)
    }

    async fn history(&self, user_id: UserId) -> Result<Vec<Trade>, LedgerError> {
        Ok(self.inner.lock().await.book.history(user_id))
    }
}
