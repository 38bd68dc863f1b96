use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::registry::RemovalReason;
use crate::schema::{SensorFrame, ValidationError};
use crate::{Error, ErrorResponse};

#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub token: CancellationToken,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Status {
    pub status: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/telemetry", post(push_telemetry))
        .route("/ws/telemetry", get(subscribe))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until the state's token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), Error> {
    let token = state.token.clone();
    info!(addr = %listener.local_addr()?, "serving http");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

pub async fn health() -> Json<Status> {
    Json(Status {
        status: "Telemetry relay running".to_string(),
    })
}

/// Accepts one sensor frame and fans it out. The body is parsed here rather
/// than with the `Json` extractor so devices that omit `Content-Type` still
/// get through.
pub async fn push_telemetry(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Ack>, (StatusCode, Json<ErrorResponse>)> {
    let value: serde_json::Value = serde_json::from_slice(&body).map_err(|err| {
        let err = ValidationError::Json(err.to_string());
        debug!(%err, "rejected telemetry push");
        (StatusCode::BAD_REQUEST, Json(ErrorResponse::from(err)))
    })?;
    let frame = SensorFrame::from_value(&value).map_err(|err| {
        debug!(%err, "rejected telemetry push");
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse::from(err)),
        )
    })?;
    let sample = state.broadcaster.publish(frame.into_sample());
    Ok(Json(Ack {
        status: "ok".to_string(),
        timestamp: sample.timestamp(),
    }))
}

pub async fn subscribe(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_samples(socket, state))
}

async fn stream_samples(socket: WebSocket, state: AppState) {
    let mut subscription = state.broadcaster.subscribe();
    let id = subscription.id();
    info!(%id, subscribers = state.broadcaster.subscribers(), "subscriber connected");
    let (mut tx, mut rx) = socket.split();
    let reason = loop {
        tokio::select! {
            _ = state.token.cancelled() => {
                let close = CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                };
                let _ = tx.send(Message::Close(Some(close))).await;
                break RemovalReason::Shutdown;
            }
            sample = subscription.recv() => {
                let Some(sample) = sample else {
                    let _ = tx.send(Message::Close(None)).await;
                    break RemovalReason::Shutdown;
                };
                let json = match sample.to_json() {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(?err, "failed to serialize sample");
                        continue;
                    }
                };
                if let Err(err) = tx.send(Message::Text(json.into())).await {
                    debug!(%id, ?err, "send failed");
                    break RemovalReason::DeliveryFailed;
                }
            }
            msg = rx.next() => match msg {
                None | Some(Ok(Message::Close(_))) => break RemovalReason::Disconnected,
                Some(Err(err)) => {
                    debug!(%id, ?err, "websocket error");
                    break RemovalReason::DeliveryFailed;
                }
                // clients have nothing to say, pings are answered by axum
                Some(Ok(_)) => {}
            }
        }
    };
    state.broadcaster.registry().remove(id, reason);
    info!(%id, ?reason, "subscriber disconnected");
}
