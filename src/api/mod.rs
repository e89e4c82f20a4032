//! HTTP API
//!
//! REST endpoints for session control, backtests and analytics, plus a
//! WebSocket log stream. Only compiled when the `api` feature is enabled.
//!
//! Callers are identified by the `x-user-id` header, set by the
//! authenticating proxy in front of this service.

mod routes;
mod types;
mod websocket;

pub use routes::create_router;
pub use types::*;
