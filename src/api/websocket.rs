//! WebSocket log stream

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use std::sync::Arc;

use super::types::CallerId;
use crate::app::TradingService;
use crate::log_stream::LogSubscription;

/// GET /ws/logs
pub(super) async fn logs_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<TradingService>>,
    CallerId(user_id): CallerId,
) -> Response {
    let subscription = service.subscribe_logs(user_id);
    ws.on_upgrade(move |socket| stream_logs(socket, subscription))
}

/// Forward log lines until either side goes away. Dropping the subscription
/// unregisters it.
async fn stream_logs(socket: WebSocket, mut subscription: LogSubscription) {
    use futures_util::{SinkExt, StreamExt};

    let user_id = subscription.user_id();
    tracing::info!(user_id, subscriber = subscription.id(), "Log stream opened");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            line = subscription.recv() => {
                let Some(line) = line else { break };
                if sender.send(Message::Text(line.message)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::info!(user_id, "Log stream closed");
}
