//! Health endpoints.
//!
//! - `GET /health` - 200 while the session hub runs, 503 once it has been
//!   cancelled
//! - `GET /ready` - 200 only while the hub runs and the WebSocket listener is
//!   accepting
//!
//! `/metrics` is merged onto the same router in `main`.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct HealthState {
    /// Child of the hub's token; cancelled when the hub stops.
    hub: CancellationToken,
    accepting: AtomicBool,
}

impl HealthState {
    #[must_use]
    pub fn new(hub: CancellationToken) -> Self {
        Self {
            hub,
            accepting: AtomicBool::new(false),
        }
    }

    /// The WebSocket listener is bound and serving.
    pub fn set_ready(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.hub.is_cancelled()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && self.is_live()
    }
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

fn check_status(ok: bool) -> (StatusCode, &'static str) {
    if ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    }
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    check_status(state.is_live())
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    check_status(state.is_ready())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn status_of(state: &Arc<HealthState>, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        health_router(Arc::clone(state))
            .oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[tokio::test]
    async fn test_ready_only_after_listener_is_accepting() {
        let state = Arc::new(HealthState::new(CancellationToken::new()));

        assert_eq!(status_of(&state, "/health").await, StatusCode::OK);
        assert_eq!(
            status_of(&state, "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready();
        assert_eq!(status_of(&state, "/ready").await, StatusCode::OK);

        state.set_not_ready();
        assert!(!state.is_ready(), "Shutdown clears readiness");
    }

    #[tokio::test]
    async fn test_cancelled_hub_fails_health_and_ready() {
        let root = CancellationToken::new();
        let state = Arc::new(HealthState::new(root.child_token()));
        state.set_ready();

        root.cancel();

        assert_eq!(
            status_of(&state, "/health").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(&state, "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new(CancellationToken::new()));
        assert_eq!(status_of(&state, "/unknown").await, StatusCode::NOT_FOUND);
    }
}
