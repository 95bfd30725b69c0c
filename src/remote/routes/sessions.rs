use crate::remote::routes::{AppState, error_response};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::path::Path as FsPath;
use tunnelforge_core::api::SessionSummary;
use tunnelforge_core::session::{is_valid_session_id, transcript_path};
use tunnelforge_terminal::TerminalError;

/// Sessions with a transcript under the control directory, sorted by id.
pub fn list_session_summaries(control_dir: &FsPath) -> std::io::Result<Vec<SessionSummary>> {
    let entries = match std::fs::read_dir(control_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let Ok(id) = entry.file_name().into_string() else {
            continue;
        };
        if !is_valid_session_id(&id) {
            continue;
        }
        if let Ok(meta) = std::fs::metadata(transcript_path(control_dir, &id)) {
            if meta.is_file() {
                sessions.push(SessionSummary {
                    id,
                    transcript_bytes: meta.len(),
                });
            }
        }
    }
    sessions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(sessions)
}

fn terminal_error(e: TerminalError) -> Response {
    match e {
        TerminalError::SessionNotFound(_) => error_response(StatusCode::NOT_FOUND, "Session not found"),
        TerminalError::ShutDown => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub async fn list_sessions(State(state): State<AppState>) -> Response {
    match list_session_summaries(state.terminals.control_dir()) {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => {
            log::error!("Failed to list sessions: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list sessions")
        }
    }
}

/// The encoded snapshot of a session's buffer.
pub async fn get_buffer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.terminals.encode_snapshot(&id) {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response(),
        Err(e) => terminal_error(e),
    }
}

pub async fn get_buffer_stats(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.terminals.buffer_stats(&id) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => terminal_error(e),
    }
}
