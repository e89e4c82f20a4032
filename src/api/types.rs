//! API request and response types

use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::app::ServiceError;
use crate::types::UserId;

/// Header carrying the authenticated user id
pub const USER_HEADER: &str = "x-user-id";

/// Generic API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Service failure rendered as an error envelope
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            tracing::error!(error = %self.0, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(ApiResponse::<()>::error(self.0.to_string()))).into_response()
    }
}

/// The calling user, from the `x-user-id` header or a `user_id` query
/// parameter (browsers cannot set headers on WebSocket upgrades)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub UserId);

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: Option<UserId>,
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok());
        let from_query = || {
            Query::<UserQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|q| q.0.user_id)
        };

        from_header.or_else(from_query).map(CallerId).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::error("missing or invalid x-user-id header")),
            )
        })
    }
}

fn default_strategy() -> String {
    "ensemble".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotRequest {
    pub exchange: String,
    pub symbol: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketRequest {
    pub exchange: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: String,
    pub was_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub label: u8,
    pub confidence: f64,
    pub signal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub version: String,
}
