use crate::remote::routes::{AppState, error_response};
use crate::stream::AttachGuard;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::convert::Infallible;
use tunnelforge_core::session::{is_valid_session_id, transcript_path};

/// Server-sent events: the pruned replay, then live records, one JSON
/// record per event. The viewer is detached when the client goes away.
pub async fn sse_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !is_valid_session_id(&id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid session id");
    }
    let path = transcript_path(state.terminals.control_dir(), &id);

    let (sink_id, rx) = match state.streams.attach(&id, &path) {
        Ok(attached) => attached,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return error_response(StatusCode::NOT_FOUND, "Session not found");
        }
        Err(e) => {
            log::error!("Failed to attach viewer to {}: {}", id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to open stream");
        }
    };

    log::info!("SSE viewer attached to {} ({} viewers)", id, state.streams.viewer_count(&id));
    let guard = AttachGuard::new(state.streams.clone(), id, sink_id);
    let events = rx.map(move |record| {
        let _guard = &guard;
        Ok::<Event, Infallible>(Event::default().data(record.to_json()))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}
