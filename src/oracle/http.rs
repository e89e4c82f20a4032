//! HTTP client for a remote model service
//!
//! `POST {base}/predict` with the candle window and `GET {base}/models/{user}`
//! for the readiness check. Status codes map onto [`OracleError`]:
//! 422 is a feature mismatch, 404 a missing model, 5xx and 429 unavailable.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{OracleError, PredictionOracle};
use crate::types::{Candle, PredictionSignal, UserId};

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    user_id: UserId,
    candles: &'a [Candle],
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    label: u8,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// Oracle backed by a model-serving HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpOracle {
    http: Client,
    base_url: String,
}

impl HttpOracle {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn classify(status: StatusCode, body: String) -> OracleError {
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.detail)
            .unwrap_or(body);
        match status {
            StatusCode::UNPROCESSABLE_ENTITY => OracleError::FeatureMismatch(detail),
            StatusCode::NOT_FOUND => OracleError::ModelMissing(detail),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                OracleError::Unavailable(format!("HTTP {}: {}", s.as_u16(), detail))
            }
            s => OracleError::InvalidResponse(format!("HTTP {}: {}", s.as_u16(), detail)),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, OracleError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, body))
    }

    fn to_signal(resp: PredictResponse) -> Result<PredictionSignal, OracleError> {
        PredictionSignal::new(resp.label, resp.confidence).ok_or_else(|| {
            OracleError::InvalidResponse(format!(
                "label {} / confidence {} out of range",
                resp.label, resp.confidence
            ))
        })
    }
}

#[async_trait]
impl PredictionOracle for HttpOracle {
    async fn predict(
        &self,
        user_id: UserId,
        window: &[Candle],
    ) -> Result<PredictionSignal, OracleError> {
        if window.is_empty() {
            return Err(OracleError::FeatureMismatch("empty candle window".to_string()));
        }

        let response = self
            .http
            .post(format!("{}/predict", self.base_url))
            .json(&PredictRequest {
                user_id,
                candles: window,
            })
            .send()
            .await?;

        let body: PredictResponse = Self::check(response).await?.json().await?;
        Self::to_signal(body)
    }

    async fn ensure_ready(&self, user_id: UserId) -> Result<(), OracleError> {
        let response = self
            .http
            .get(format!("{}/models/{}", self.base_url, user_id))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }
}
