//! Binance spot REST client
//!
//! Public klines for market data and the signed account endpoint for
//! balances. Paper accounts are routed to the spot testnet.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use super::{Balances, Exchange, ExchangeConnector, ExchangeError};
use crate::config::ExchangeSettings;
use crate::persistence::settings::{ApiCredentials, SettingsStore};
use crate::types::{Candle, TradingMode, UserId};

const KLINES_PATH: &str = "/api/v3/klines";
const ACCOUNT_PATH: &str = "/api/v3/account";
const MAX_KLINES_PER_REQUEST: usize = 1000;
const RECV_WINDOW_MS: u64 = 5000;

/// Binance REST client bound to one account
#[derive(Debug, Clone)]
pub struct BinanceClient {
    http: Client,
    base_url: String,
    mode: TradingMode,
    credentials: Option<ApiCredentials>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    msg: String,
}

impl BinanceClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        mode: TradingMode,
        credentials: Option<ApiCredentials>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            mode,
            credentials,
        }
    }

    /// "BTC/USDT" -> "BTCUSDT"
    pub fn market_id(symbol: &str) -> String {
        symbol
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase()
    }

    fn sign(secret: &str, query: &str) -> Result<String, ExchangeError> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::Credentials(format!("invalid API secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.msg)
            .unwrap_or(body);
        if status.is_server_error() || status.as_u16() == 429 {
            tracing::warn!(status = status.as_u16(), "Binance throttled or unavailable");
        }
        Err(ExchangeError::Exchange {
            status: Some(status.as_u16()),
            message,
        })
    }

    /// Total per asset. Zero balances are kept so a drained asset reads as 0.
    fn totals(balances: Vec<AssetBalance>) -> Balances {
        balances
            .into_iter()
            .filter_map(|b| {
                let free: f64 = b.free.parse().ok()?;
                let locked: f64 = b.locked.parse().ok()?;
                Some((b.asset, free + locked))
            })
            .collect()
    }

    /// Parse one kline row: [open_time, open, high, low, close, volume, close_time, ...]
    fn parse_kline(row: &[serde_json::Value]) -> Option<Candle> {
        if row.len() < 6 {
            return None;
        }
        let num = |v: &serde_json::Value| -> Option<f64> { v.as_str()?.parse().ok() };
        Some(Candle {
            timestamp: row[0].as_i64()?,
            open: num(&row[1])?,
            high: num(&row[2])?,
            low: num(&row[3])?,
            close: num(&row[4])?,
            volume: num(&row[5])?,
        })
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    fn mode(&self) -> TradingMode {
        self.mode
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!("{}{}", self.base_url, KLINES_PATH);
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST).to_string();
        let market = Self::market_id(symbol);

        let response = self
            .http
            .get(&url)
            .query(&[
                ("symbol", market.as_str()),
                ("interval", timeframe),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        let rows: Vec<Vec<serde_json::Value>> = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ExchangeError::exchange(format!("malformed klines response: {}", e)))?;

        let candles: Vec<Candle> = rows.iter().filter_map(|r| Self::parse_kline(r)).collect();

        tracing::debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            count = candles.len(),
            "Fetched klines from Binance"
        );

        Ok(candles)
    }

    async fn fetch_balance(&self) -> Result<Balances, ExchangeError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Credentials("API key not configured".to_string()))?;

        let query = format!(
            "timestamp={}&recvWindow={}",
            Utc::now().timestamp_millis(),
            RECV_WINDOW_MS
        );
        let signature = Self::sign(&credentials.secret, &query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, ACCOUNT_PATH, query, signature
        );

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &credentials.key)
            .send()
            .await?;

        let account: AccountResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ExchangeError::exchange(format!("malformed account response: {}", e)))?;

        Ok(Self::totals(account.balances))
    }
}

/// Creates per-user Binance clients from stored settings
pub struct BinanceConnector {
    http: Client,
    settings: Arc<dyn SettingsStore>,
    config: ExchangeSettings,
}

impl BinanceConnector {
    pub fn new(settings: Arc<dyn SettingsStore>, config: ExchangeSettings) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            settings,
            config,
        })
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    async fn connect(
        &self,
        user_id: UserId,
        exchange_id: &str,
    ) -> Result<Box<dyn Exchange>, ExchangeError> {
        if !exchange_id.eq_ignore_ascii_case("binance") {
            return Err(ExchangeError::Unsupported(exchange_id.to_string()));
        }

        let settings = self
            .settings
            .get(user_id)
            .await
            .ok_or_else(|| ExchangeError::Credentials("user settings not found".to_string()))?;

        let mode = settings.trading_mode;
        let credentials = settings.credentials_for(mode).cloned();
        if mode == TradingMode::Live && credentials.is_none() {
            return Err(ExchangeError::Credentials(
                "live API credentials are not set".to_string(),
            ));
        }

        let base_url = match mode {
            TradingMode::Live => self.config.binance_rest_url.clone(),
            TradingMode::Paper => self.config.binance_testnet_url.clone(),
        };

        Ok(Box::new(BinanceClient::new(
            self.http.clone(),
            base_url,
            mode,
            credentials,
        )))
    }
}
