//! Job control handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use orca_services::{Job, JobError, JobStatus};

use super::{job_error, ApiError, ApiState, ErrorList, StatusResponse};

#[derive(Deserialize)]
pub struct JobIdRef {
    #[serde(rename = "jobID")]
    pub job_id: String,
}

// ── /add-job (PUT) ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddJobRequest {
    pub file_hash: String,
    /// Holder peer id; empty picks the cheapest holder at start.
    #[serde(default)]
    pub peer: String,
}

#[derive(Serialize, Deserialize)]
pub struct AddJobResponse {
    #[serde(rename = "jobID")]
    pub job_id: String,
}

pub async fn handle_add_job(
    State(state): State<ApiState>,
    Json(req): Json<AddJobRequest>,
) -> Result<Json<AddJobResponse>, ApiError> {
    if req.file_hash.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "fileHash is required".to_string()));
    }
    let job = state.jobs.add_job(&req.file_hash, &req.peer).await;
    Ok(Json(AddJobResponse { job_id: job.job_id }))
}

// ── /job-info, /job-list (GET) ────────────────────────────────────────────────

pub async fn handle_job_info(
    State(state): State<ApiState>,
    Query(q): Query<JobIdRef>,
) -> Result<Json<Job>, ApiError> {
    state.jobs.find_job(&q.job_id).await.map(Json).map_err(job_error)
}

pub async fn handle_job_list(State(state): State<ApiState>) -> Json<Vec<Job>> {
    Json(state.jobs.list().await)
}

// ── /job-peer (GET) ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPeerQuery {
    pub file_hash: String,
    pub peer: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPeerResponse {
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub file_hash: String,
    pub peer_id: String,
    pub location: String,
    pub status: JobStatus,
    pub accumulated_cost: u64,
    pub price_per_chunk: u64,
}

pub async fn handle_job_peer(
    State(state): State<ApiState>,
    Query(q): Query<JobPeerQuery>,
) -> Result<Json<JobPeerResponse>, ApiError> {
    let job = state
        .jobs
        .find_by_peer(&q.file_hash, &q.peer)
        .await
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("no job for file {} from peer {}", q.file_hash, q.peer),
            )
        })?;
    let location = state
        .directory
        .get(&q.peer)
        .await
        .map(|p| p.location)
        .unwrap_or_default();
    Ok(Json(JobPeerResponse {
        job_id: job.job_id,
        file_hash: job.file_hash,
        peer_id: job.peer_id,
        location,
        status: job.status,
        accumulated_cost: job.accumulated_cost,
        price_per_chunk: job.price_per_chunk,
    }))
}

// ── /start-jobs, /pause-jobs, /terminate-jobs (PATCH) ─────────────────────────

type BatchResult = Result<Json<StatusResponse>, (StatusCode, Json<ErrorList>)>;

fn batch_result(errors: Vec<JobError>) -> BatchResult {
    if errors.is_empty() {
        return Ok(StatusResponse::success());
    }
    Err((
        StatusCode::BAD_REQUEST,
        Json(ErrorList {
            errors: errors.iter().map(ToString::to_string).collect(),
        }),
    ))
}

fn ids(refs: Vec<JobIdRef>) -> Vec<String> {
    refs.into_iter().map(|r| r.job_id).collect()
}

pub async fn handle_start_jobs(
    State(state): State<ApiState>,
    Json(refs): Json<Vec<JobIdRef>>,
) -> BatchResult {
    batch_result(state.runner.start_jobs(&ids(refs)).await)
}

pub async fn handle_pause_jobs(
    State(state): State<ApiState>,
    Json(refs): Json<Vec<JobIdRef>>,
) -> BatchResult {
    let mut errors = Vec::new();
    for id in ids(refs) {
        if let Err(e) = state.jobs.pause_job(&id).await {
            errors.push(e);
        }
    }
    batch_result(errors)
}

pub async fn handle_terminate_jobs(
    State(state): State<ApiState>,
    Json(refs): Json<Vec<JobIdRef>>,
) -> BatchResult {
    let mut errors = Vec::new();
    for id in ids(refs) {
        if let Err(e) = state.jobs.terminate_job(&id).await {
            errors.push(e);
        }
    }
    batch_result(errors)
}

// ── /remove-from-history, /clear-history (PATCH) ──────────────────────────────

pub async fn handle_remove_from_history(
    State(state): State<ApiState>,
    Json(req): Json<JobIdRef>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .jobs
        .remove_from_history(&req.job_id)
        .await
        .map_err(job_error)?;
    Ok(StatusResponse::success())
}

#[derive(Serialize, Deserialize)]
pub struct ClearHistoryResponse {
    pub removed: usize,
}

/// Persisted by the job saver on its next tick.
pub async fn handle_clear_history(State(state): State<ApiState>) -> Json<ClearHistoryResponse> {
    let removed = state.jobs.clear_history().await;
    tracing::info!(removed, "history cleared");
    Json(ClearHistoryResponse { removed })
}
