//! /holders and /files handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use orca_core::record::HolderEntry;
use orca_services::{FileManifest, MarketError};

use super::{ApiError, ApiState};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldersQuery {
    pub file_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderView {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
    pub price: u64,
}

impl From<HolderEntry> for HolderView {
    fn from(h: HolderEntry) -> Self {
        Self {
            peer_id: h.peer_id(),
            ip: h.ip,
            port: h.port,
            price: h.price,
        }
    }
}

/// Holders of a file, cheapest first.
pub async fn handle_holders(
    State(state): State<ApiState>,
    Query(q): Query<HoldersQuery>,
) -> Result<Json<Vec<HolderView>>, ApiError> {
    match state.market.lookup_ranked(&q.file_hash).await {
        Ok(holders) => Ok(Json(holders.into_iter().map(HolderView::from).collect())),
        Err(e @ MarketError::StorageUnavailable(_)) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

pub async fn handle_files(State(state): State<ApiState>) -> Json<Vec<FileManifest>> {
    Json(state.store.manifests())
}
