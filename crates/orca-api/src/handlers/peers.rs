//! Peer directory handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use orca_services::PeerInfo;

use super::{ApiError, ApiState, StatusResponse};

#[derive(Deserialize)]
pub struct PeerQuery {
    #[serde(rename = "peerID")]
    pub peer_id: String,
}

pub async fn handle_get_peers(State(state): State<ApiState>) -> Json<Vec<PeerInfo>> {
    Json(state.directory.list().await)
}

pub async fn handle_get_peer(
    State(state): State<ApiState>,
    Query(q): Query<PeerQuery>,
) -> Result<Json<PeerInfo>, ApiError> {
    state
        .directory
        .get(&q.peer_id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("peer {} not found", q.peer_id)))
}

pub async fn handle_remove_peer(
    State(state): State<ApiState>,
    Query(q): Query<PeerQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    if !state.directory.remove(&q.peer_id).await {
        return Err((StatusCode::BAD_REQUEST, format!("peer {} not found", q.peer_id)));
    }
    tracing::info!(peer = %q.peer_id, "peer removed");
    Ok(StatusResponse::success())
}
