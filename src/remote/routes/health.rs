use crate::remote::routes::AppState;
use axum::Json;
use axum::extract::State;
use tunnelforge_core::api::HealthResponse;

pub async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
        hq_mode: state.registry.is_some(),
    })
}
