use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use pkg_constants::state::APP_ELECTION_KEY;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct LeaderInfo {
    pub local_node: String,
    pub leader: Option<String>,
    pub is_leader: bool,
    pub pipeline_failures: u64,
    pub reconcilers: Vec<&'static str>,
}

/// GET /api/v1/leader
pub async fn leader(State(state): State<AppState>) -> impl IntoResponse {
    let leadership = &state.ctx.leadership;
    Json(LeaderInfo {
        local_node: leadership.local_node().to_string(),
        leader: leadership.leader(APP_ELECTION_KEY),
        is_leader: state.ctx.is_leader(),
        pipeline_failures: state.ctx.programmer.failures(),
        reconcilers: state.manager.reconciler_names(),
    })
}

/// POST /api/v1/resync : queue a full resync on every reconciler.
pub async fn resync(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.resync_all();
    StatusCode::ACCEPTED
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
