//! HTTP and WebSocket surface over the supervisor.
//!
//! Authentication is the embedding application's concern; these handlers
//! only read from the facade and stream its snapshots.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;

use gangway_tunnel::{RuntimeError, StateSnapshot, Supervisor};

const PODMAN_UNAVAILABLE_MESSAGE: &str = "Podman is not available on the server.";
const LOAD_FAILED_MESSAGE: &str = "Failed to load containers.";

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    monitors: usize,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamMessage {
    Tunnels { data: StateSnapshot },
}

pub fn router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/containers", get(list_containers))
        .route("/containers/stream", get(stream_containers))
        .with_state(supervisor)
}

async fn healthz(State(supervisor): State<Supervisor>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        monitors: supervisor.monitor_count(),
    })
}

async fn list_containers(State(supervisor): State<Supervisor>) -> impl IntoResponse {
    match supervisor.list_enriched().await {
        Ok(containers) => Json(containers).into_response(),
        Err(RuntimeError::Unavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                message: PODMAN_UNAVAILABLE_MESSAGE.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "container listing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    message: LOAD_FAILED_MESSAGE.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn stream_containers(
    State(supervisor): State<Supervisor>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_socket(supervisor, socket))
}

async fn handle_stream_socket(supervisor: Supervisor, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = supervisor.subscribe();

    loop {
        tokio::select! {
            snapshot = subscription.recv() => {
                match snapshot {
                    Some(snapshot) => {
                        let message = StreamMessage::Tunnels { data: snapshot };
                        let Ok(text) = serde_json::to_string(&message) else {
                            break;
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Subscription closed: shutdown, or this client fell too
                    // far behind and was dropped by the notifier.
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
