//! Per-user account settings
//!
//! Trading mode, drawdown limit and exchange credentials. The store is read by
//! the exchange connector and the circuit breaker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

use crate::types::{TradingMode, UserId};

/// Exchange API key pair
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: String,
}

impl ApiCredentials {
    fn is_usable(&self) -> bool {
        !self.key.trim().is_empty() && !self.secret.trim().is_empty()
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("key", &self.key)
            .field("secret", &"***")
            .finish()
    }
}

/// Settings of one user account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub trading_mode: TradingMode,
    /// Drawdown (percent) at which the circuit breaker stops every session
    pub max_daily_drawdown_pct: f64,
    /// Testnet keys
    pub paper_credentials: Option<ApiCredentials>,
    /// Mainnet keys
    pub live_credentials: Option<ApiCredentials>,
    pub default_symbol: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paper,
            max_daily_drawdown_pct: 5.0,
            paper_credentials: None,
            live_credentials: None,
            default_symbol: "BTC/USDT".to_string(),
        }
    }
}

impl UserSettings {
    /// Credentials for `mode`, ignoring blank entries
    pub fn credentials_for(&self, mode: TradingMode) -> Option<&ApiCredentials> {
        let creds = match mode {
            TradingMode::Paper => self.paper_credentials.as_ref(),
            TradingMode::Live => self.live_credentials.as_ref(),
        };
        creds.filter(|c| c.is_usable())
    }
}

/// Read access to user settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, user_id: UserId) -> Option<UserSettings>;
}

/// Settings held in memory, seeded from configuration
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    users: RwLock<HashMap<UserId, UserSettings>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = (UserId, UserSettings)>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().collect()),
        }
    }

    /// Insert or replace the settings of a user
    pub async fn put(&self, user_id: UserId, settings: UserSettings) {
        self.users.write().await.insert(user_id, settings);
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, user_id: UserId) -> Option<UserSettings> {
        self.users.read().await.get(&user_id).cloned()
    }
}
