//! `GET /ws` - signaling WebSocket endpoint.
//!
//! The bearer credential comes from the `Authorization` header or the
//! `token` query parameter and is verified before the upgrade. A missing or
//! invalid credential gets 401 and no session state is created.

use super::protocol::ServerFrame;
use super::session::SignalingSession;
use super::SignalingState;
use crate::actors::ConnectionActor;
use crate::auth::Identity;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common::jwt::bearer_token;
use common::types::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest accepted client frame. Signaling payloads are small.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Frames buffered between the connection actor and the socket writer.
const OUTBOUND_BUFFER: usize = 64;

/// Time the socket writer gets to flush after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Build the signaling router.
pub fn signaling_router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Credential from the header, falling back to the query string.
fn credential(headers: &HeaderMap, query: WsQuery) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(query.token)
        .filter(|t| !t.is_empty())
}

async fn ws_handler(
    State(state): State<Arc<SignalingState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(token) = credential(&headers, query) else {
        debug!(target: "rc.signaling", "Connection without credential rejected");
        return (StatusCode::UNAUTHORIZED, "Missing access token").into_response();
    };

    let identity = match state.verifier.verify(&token).await {
        Ok(identity) => identity,
        Err(e) => {
            debug!(target: "rc.signaling", error = %e, "Connection with bad credential rejected");
            return (StatusCode::UNAUTHORIZED, e.client_message()).into_response();
        }
    };

    let Some(upgrade) = upgrade else {
        return (StatusCode::UPGRADE_REQUIRED, "Expected a WebSocket upgrade").into_response();
    };

    upgrade
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| run_connection(socket, state, identity))
}

/// Drive one authenticated socket until the client goes away.
async fn run_connection(socket: WebSocket, state: Arc<SignalingState>, identity: Identity) {
    let connection_id = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let (connection, connection_task) = ConnectionActor::spawn(
        connection_id,
        identity.participant_id.clone(),
        outbound_tx,
        CancellationToken::new(),
        Arc::clone(&state.metrics),
    );

    info!(
        target: "rc.signaling",
        connection_id = %connection_id,
        role = identity.role.as_str(),
        "Signaling connection opened"
    );

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "rc.signaling", error = %e, "Skipping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = SignalingSession::new(Arc::clone(&state), identity, connection);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %connection_id,
                    "Ignoring binary frame"
                );
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %connection_id,
                    error = %e,
                    "Socket read failed"
                );
                break;
            }
        }
    }

    // Same cleanup for close frames, read errors and end of stream.
    session.close().await;
    let _ = connection_task.await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(
            target: "rc.signaling",
            connection_id = %connection_id,
            "Socket writer did not drain in time"
        );
    }

    info!(
        target: "rc.signaling",
        connection_id = %connection_id,
        "Signaling connection closed"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(token: Option<&str>) -> WsQuery {
        WsQuery {
            token: token.map(str::to_string),
        }
    }

    #[test]
    fn test_credential_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(
            credential(&headers, query(Some("from-query"))).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn test_credential_falls_back_to_query() {
        let headers = HeaderMap::new();
        assert_eq!(
            credential(&headers, query(Some("from-query"))).as_deref(),
            Some("from-query")
        );
        assert_eq!(credential(&headers, query(Some(""))), None);
        assert_eq!(credential(&headers, query(None)), None);
    }
}
