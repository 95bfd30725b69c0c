pub mod buffers;
pub mod health;
pub mod remotes;
pub mod sessions;
pub mod stream;

use crate::remote::hub::BufferHub;
use crate::remote::registry::MemoryRegistry;
use crate::stream::StreamWatcher;
use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tunnelforge_core::api::ErrorResponse;
use tunnelforge_terminal::TerminalManager;

/// Shared state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub terminals: TerminalManager,
    pub streams: StreamWatcher,
    pub hub: BufferHub,
    /// Present only in HQ mode.
    pub registry: Option<Arc<MemoryRegistry>>,
    pub auth_token: Option<Arc<str>>,
    pub http: reqwest::Client,
    pub start_time: Instant,
}

/// Build the complete axum router.
pub fn build_router(state: AppState) -> Router {
    // Routes that require auth
    let protected = Router::new()
        .route("/buffers", axum::routing::get(buffers::ws_handler))
        .route("/api/sessions", axum::routing::get(sessions::list_sessions))
        .route(
            "/api/sessions/{id}/buffer",
            axum::routing::get(sessions::get_buffer),
        )
        .route(
            "/api/sessions/{id}/buffer/stats",
            axum::routing::get(sessions::get_buffer_stats),
        )
        .route(
            "/api/sessions/{id}/stream",
            axum::routing::get(stream::sse_handler),
        )
        .route("/api/remotes", axum::routing::get(remotes::list_remotes))
        .route(
            "/api/remotes/register",
            axum::routing::post(remotes::register_remote),
        )
        .route(
            "/api/remotes/{id}",
            axum::routing::delete(remotes::unregister_remote),
        )
        .route(
            "/api/remotes/{name}/refresh-sessions",
            axum::routing::post(remotes::refresh_sessions),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Public routes (no auth required)
    let public = Router::new().route("/health", axum::routing::get(health::get_health));

    public
        .merge(protected)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .with_state(state)
}

/// JSON error body with a status code.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Pull the presented token from `Authorization: Bearer` or `?token=`.
fn presented_token(req: &Request) -> Option<String> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = header {
        return Some(token.to_string());
    }
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    })
}

/// Auth middleware: validates the configured token on protected routes,
/// including the `/buffers` upgrade. Everything is open when no token is set.
async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.auth_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let Some(token) = presented_token(&req) else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    if !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        log::debug!("Rejected request to {} with a bad token", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

