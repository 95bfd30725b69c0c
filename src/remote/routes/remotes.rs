use crate::remote::registry::MemoryRegistry;
use crate::remote::routes::{AppState, error_response};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Duration;
use tunnelforge_core::api::{
    RefreshSessionsResponse, RegisterRemoteRequest, RegisterRemoteResponse, RemoteSummary,
    SessionSummary, SuccessResponse,
};
use tunnelforge_core::remote::RemoteServer;

const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

fn hq_registry(state: &AppState) -> Result<&Arc<MemoryRegistry>, Response> {
    state
        .registry
        .as_ref()
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "Not running in HQ mode"))
}

pub async fn list_remotes(State(state): State<AppState>) -> Response {
    let registry = match hq_registry(&state) {
        Ok(registry) => registry,
        Err(resp) => return resp,
    };
    let remotes: Vec<RemoteSummary> = registry.list().iter().map(RemoteSummary::from).collect();
    Json(remotes).into_response()
}

pub async fn register_remote(
    State(state): State<AppState>,
    Json(req): Json<RegisterRemoteRequest>,
) -> Response {
    let registry = match hq_registry(&state) {
        Ok(registry) => registry,
        Err(resp) => return resp,
    };
    if !req.is_complete() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing required fields: id, name, url, token",
        );
    }

    let url = req.url.trim_end_matches('/').to_string();
    let remote = match registry.register(RemoteServer::new(req.id, req.name, url, req.token)) {
        Ok(remote) => remote,
        Err(e) => return error_response(StatusCode::CONFLICT, e.to_string()),
    };

    let hub = state.hub.clone();
    let remote_id = remote.id.clone();
    tokio::spawn(async move { hub.on_remote_registered(&remote_id).await });

    Json(RegisterRemoteResponse {
        success: true,
        remote: RemoteSummary::from(&remote),
    })
    .into_response()
}

pub async fn unregister_remote(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let registry = match hq_registry(&state) {
        Ok(registry) => registry,
        Err(resp) => return resp,
    };
    if registry.unregister(&id).is_none() {
        return error_response(StatusCode::NOT_FOUND, "Remote not found");
    }
    state.hub.on_remote_unregistered(&id);
    Json(SuccessResponse { success: true }).into_response()
}

/// Ask a remote which sessions it owns and route them to it.
async fn fetch_remote_sessions(
    http: &reqwest::Client,
    remote: &RemoteServer,
) -> anyhow::Result<Vec<SessionSummary>> {
    let sessions = http
        .get(format!("{}/api/sessions", remote.url))
        .bearer_auth(&remote.token)
        .timeout(REFRESH_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<SessionSummary>>()
        .await?;
    Ok(sessions)
}

pub async fn refresh_sessions(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let registry = match hq_registry(&state) {
        Ok(registry) => registry,
        Err(resp) => return resp,
    };
    let Some(remote) = registry.find_by_name(&name) else {
        return error_response(StatusCode::NOT_FOUND, "Remote not found");
    };

    match fetch_remote_sessions(&state.http, &remote).await {
        Ok(sessions) => {
            let count = sessions.len();
            registry.update_sessions(&remote.id, sessions.into_iter().map(|s| s.id));
            log::info!("Remote {} owns {} sessions", remote.name, count);
            Json(RefreshSessionsResponse {
                success: true,
                session_count: count,
            })
            .into_response()
        }
        Err(e) => {
            log::error!("Failed to refresh sessions for remote {}: {:#}", remote.name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to refresh sessions")
        }
    }
}
