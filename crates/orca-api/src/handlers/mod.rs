//! HTTP API handlers for job control, market and peer views as JSON.

pub mod jobs;
pub mod market;
pub mod peers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use orca_services::{ChunkStore, JobError, JobManager, JobRunner, MarketService, PeerDirectory};

#[derive(Clone)]
pub struct ApiState {
    pub jobs: Arc<JobManager>,
    pub runner: JobRunner,
    pub market: Arc<MarketService>,
    pub store: ChunkStore,
    pub directory: Arc<PeerDirectory>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, serde::Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn success() -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
        })
    }
}

/// Per-job failures from a batch operation.
#[derive(Debug, Serialize, serde::Deserialize)]
pub struct ErrorList {
    pub errors: Vec<String>,
}

type ApiError = (StatusCode, String);

fn job_error(e: JobError) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

pub use jobs::{
    handle_add_job, handle_clear_history, handle_job_info, handle_job_list, handle_job_peer,
    handle_pause_jobs, handle_remove_from_history, handle_start_jobs, handle_terminate_jobs,
};
pub use market::{handle_files, handle_holders};
pub use peers::{handle_get_peer, handle_get_peers, handle_remove_peer};
