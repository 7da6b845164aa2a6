//! WebSocket transport.
//!
//! Authentication happens before the upgrade. A connection that cannot be
//! tied to a known, unbanned user never gets a socket.
//!
//! Each accepted socket gets two halves:
//! 1. A writer task drains the connection's [`ChannelReceiver`] into the socket
//! 2. The reader loop parses text frames and hands them to the dispatcher

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use common::jwt::MAX_JWT_SIZE_BYTES;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{dispatch_text, ConnectionContext};
use crate::auth::Authenticator;
use crate::errors::SessionError;
use crate::hub::SessionHub;
use crate::models::UserRecord;
use crate::observability::metrics;
use crate::registry::{ChannelReceiver, ClientChannel, Outbound};

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<SessionHub>,
    pub authenticator: Arc<dyn Authenticator>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

/// Router exposing `GET /ws`.
pub fn ws_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Token from the `token` query parameter, else a `Bearer` header.
fn extract_token<'a>(params: &'a ConnectParams, headers: &'a HeaderMap) -> Option<&'a str> {
    if let Some(token) = params.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve a connection's token to its user record.
///
/// # Errors
///
/// - `Unauthorized` - missing, oversized or invalid token, or unknown user
/// - `PermissionDenied` - the user is banned
/// - `Store` - lookup failed
pub async fn authenticate(
    state: &WsState,
    token: Option<&str>,
) -> Result<UserRecord, SessionError> {
    let token =
        token.ok_or_else(|| SessionError::Unauthorized("Missing token".to_string()))?;
    if token.len() > MAX_JWT_SIZE_BYTES {
        return Err(SessionError::Unauthorized("Token too large".to_string()));
    }
    let identity = state
        .authenticator
        .verify(token)
        .ok_or_else(|| SessionError::Unauthorized("Invalid token".to_string()))?;

    let user = state
        .hub
        .store()
        .find_user_by_username(&identity.username)
        .await?
        .ok_or_else(|| SessionError::Unauthorized("Unknown user".to_string()))?;
    if user.is_banned(Utc::now()) {
        return Err(SessionError::PermissionDenied("Account is banned".to_string()));
    }
    Ok(user)
}

fn error_response(err: &SessionError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(serde_json::json!({
        "code": err.error_code(),
        "message": err.client_message(),
    }));
    (status, body).into_response()
}

async fn ws_handler(
    State(state): State<WsState>,
    params: Result<Query<ConnectParams>, QueryRejection>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> Response {
    let params = params.map(|Query(p)| p).unwrap_or_default();
    let user = match authenticate(&state, extract_token(&params, &headers)).await {
        Ok(user) => user,
        Err(e) => {
            debug!(target: "rv.dispatch", error = %e, "Rejected connection");
            metrics::record_error(e.error_type_label());
            return error_response(&e);
        }
    };

    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, user)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: WsState, user: UserRecord) {
    let user_id = user.id;
    let (channel, outbound) = ClientChannel::new(user_id, state.hub.cancel_token());
    let connection_id = channel.connection_id();
    let severed = channel.cancel_token().clone();

    state.hub.connect(&user, channel.clone());

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_outbound(sink, outbound));

    let mut ctx = ConnectionContext::new(user, channel);
    loop {
        tokio::select! {
            biased;
            () = severed.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch_text(&state.hub, &mut ctx, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(target: "rv.dispatch", user_id = %user_id, error = %e, "Socket read failed");
                    break;
                }
            },
        }
    }

    state.hub.disconnect(user_id, connection_id).await;
    ctx.channel().sever("disconnected");
    if let Err(e) = writer.await {
        warn!(target: "rv.dispatch", user_id = %user_id, error = %e, "Writer task failed");
    }
    info!(target: "rv.dispatch", user_id = %user_id, connection_id = %connection_id, "Socket closed");
}

async fn write_outbound<S>(mut sink: S, mut outbound: ChannelReceiver)
where
    S: futures::Sink<Message> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Event(event) => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "rv.dispatch", event = event.kind(), error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { reason } => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::SessionConfig;
    use crate::store::{MemoryStore, Store};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    /// Accepts any token equal to a known username.
    struct EchoAuthenticator;

    impl Authenticator for EchoAuthenticator {
        fn verify(&self, token: &str) -> Option<Identity> {
            token.strip_prefix("valid-").map(|name| Identity {
                username: name.to_string(),
            })
        }
    }

    fn state() -> (WsState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (hub, _timer_rx) = SessionHub::new(
            Arc::clone(&store) as Arc<dyn Store>,
            SessionConfig::default(),
            CancellationToken::new(),
        );
        let state = WsState {
            hub,
            authenticator: Arc::new(EchoAuthenticator),
        };
        (state, store)
    }

    fn params(token: Option<&str>) -> ConnectParams {
        ConnectParams {
            token: token.map(str::to_string),
        }
    }

    #[test]
    fn test_query_token_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer from-header".parse().unwrap());

        assert_eq!(
            extract_token(&params(Some("from-query")), &headers),
            Some("from-query")
        );
        assert_eq!(extract_token(&params(None), &headers), Some("from-header"));
        assert_eq!(extract_token(&params(Some("")), &HeaderMap::new()), None);
    }

    #[test]
    fn test_non_bearer_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(extract_token(&params(None), &headers), None);
    }

    #[tokio::test]
    async fn test_authenticate_known_user() {
        let (state, store) = state();
        let alice = store.create_user("alice");

        let user = authenticate(&state, Some("valid-alice")).await.unwrap();
        assert_eq!(user.id, alice.id);
    }

    #[tokio::test]
    async fn test_authenticate_rejections() {
        let (state, store) = state();
        let mut banned = store.create_user("eve");
        banned.banned_until = Some(Utc::now() + chrono::Duration::days(1));
        store.put_user(banned);

        let missing = authenticate(&state, None).await.unwrap_err();
        let invalid = authenticate(&state, Some("forged")).await.unwrap_err();
        let unknown = authenticate(&state, Some("valid-nobody")).await.unwrap_err();
        let oversized = "x".repeat(MAX_JWT_SIZE_BYTES + 1);
        let too_big = authenticate(&state, Some(&oversized)).await.unwrap_err();
        let banned = authenticate(&state, Some("valid-eve")).await.unwrap_err();

        for err in [&missing, &invalid, &unknown, &too_big] {
            assert_eq!(err.status_code(), 401);
        }
        assert_eq!(banned.status_code(), 403);
    }

    #[tokio::test]
    async fn test_route_rejects_before_upgrade() {
        let (state, _store) = state();
        let app = ws_router(state);

        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_route_authenticates_then_requires_upgrade() {
        let (state, store) = state();
        store.create_user("alice");
        let app = ws_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws?token=valid-alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Plain HTTP cannot be upgraded, but it got past authentication.
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
        assert_ne!(response.status(), StatusCode::FORBIDDEN);
    }
}
