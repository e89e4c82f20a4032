//! Route table and REST handlers

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::types::*;
use super::websocket::logs_handler;
use crate::app::TradingService;
use crate::backtesting::BacktestReport;
use crate::persistence::DownloadSummary;
use crate::session::{SessionInfo, StartOutcome};
use crate::types::{SessionKey, Trade};

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Create the API router with all endpoints
pub fn create_router(service: Arc<TradingService>) -> Router {
    Router::new()
        .route("/health", get(health))
        // Session control
        .route("/bot/start", post(start_bot))
        .route("/bot/stop", post(stop_bot))
        .route("/bot/status", get(bot_status))
        .route("/bot/sessions", get(list_sessions))
        // Research
        .route("/backtest", post(backtest))
        .route("/predict", post(predict))
        .route("/data/download", post(download_data))
        .route("/analytics/trade-history", get(trade_history))
        // Log stream
        .route("/ws/logs", get(logs_handler))
        .with_state(service)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// GET /health
async fn health(State(service): State<Arc<TradingService>>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "ok".to_string(),
        active_sessions: service.registry().active_keys().len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// POST /bot/start
async fn start_bot(
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
    Json(req): Json<BotRequest>,
) -> ApiResult<StartOutcome> {
    let key = SessionKey::new(user_id, req.exchange, req.symbol);
    let outcome = service.start(key, &req.strategy).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// POST /bot/stop
async fn stop_bot(
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
    Json(req): Json<BotRequest>,
) -> Json<ApiResponse<StopResponse>> {
    let key = SessionKey::new(user_id, req.exchange, req.symbol);
    let was_running = service.stop(&key);
    Json(ApiResponse::success(StopResponse {
        status: "stopped".to_string(),
        was_running,
    }))
}

/// GET /bot/status?exchange=..&symbol=..
async fn bot_status(
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
    Query(req): Query<MarketRequest>,
) -> Json<ApiResponse<StatusResponse>> {
    let key = SessionKey::new(user_id, req.exchange, req.symbol);
    Json(ApiResponse::success(StatusResponse {
        running: service.status(&key),
    }))
}

/// GET /bot/sessions
async fn list_sessions(
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
) -> Json<ApiResponse<Vec<SessionInfo>>> {
    Json(ApiResponse::success(service.sessions(user_id)))
}

/// POST /backtest
async fn backtest(
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
    Json(req): Json<MarketRequest>,
) -> ApiResult<BacktestReport> {
    let report = service.backtest(user_id, &req.exchange, &req.symbol).await?;
    Ok(Json(ApiResponse::success(report)))
}

/// POST /predict
async fn predict(
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
    Json(req): Json<MarketRequest>,
) -> ApiResult<PredictionResponse> {
    let signal = service.predict(user_id, &req.exchange, &req.symbol).await?;
    Ok(Json(ApiResponse::success(PredictionResponse {
        label: signal.label,
        confidence: signal.confidence,
        signal: signal.to_string(),
    })))
}

/// POST /data/download
async fn download_data(
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
    Json(req): Json<DownloadRequest>,
) -> ApiResult<DownloadSummary> {
    let summary = service
        .download(
            user_id,
            &req.exchange,
            &req.symbol,
            req.timeframe.as_deref(),
            req.limit,
        )
        .await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// GET /analytics/trade-history
async fn trade_history(
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
) -> ApiResult<Vec<Trade>> {
    let trades = service.trade_history(user_id).await?;
    Ok(Json(ApiResponse::success(trades)))
}
