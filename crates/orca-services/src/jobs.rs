//! Job engine: download jobs, their state machine, cost accounting, and history.
//!
//! ```text
//! queued ──► active ◄──► paused
//!              │
//!              ├──► finished
//!              ├──► terminated
//!              └──► error
//! ```
//!
//! The table sits behind one exclusive lock that is never held across I/O.
//! Every mutation bumps a version number; the saver persists the table only
//! when the version is ahead of the last successful save. Status changes are
//! published on a `watch` channel so a paused transfer wakes as soon as it
//! is resumed or terminated.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};

/// Cause recorded on a job the user terminated.
pub const TERMINATED_BY_REQUEST: &str = "terminated by request";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Paused,
    Finished,
    Terminated,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Terminated | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub file_hash: String,
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub time_queued: DateTime<Utc>,
    pub status: JobStatus,
    pub accumulated_cost: u64,
    pub projected_cost: u64,
    /// Estimated seconds remaining.
    pub eta: u64,
    /// Holder peer id (hex public key). Empty = cheapest holder.
    #[serde(rename = "peer")]
    pub peer_id: String,
    #[serde(default)]
    pub last_error: Option<String>,
    /// First chunk not yet received.
    #[serde(default)]
    pub next_chunk: u64,
    /// Bytes of the download covered by chunks before `next_chunk`.
    #[serde(default)]
    pub bytes_received: u64,
    /// Zero until the first response arrives.
    #[serde(default)]
    pub max_chunks: u64,
    #[serde(default)]
    pub price_per_chunk: u64,
}

impl Job {
    fn new(file_hash: &str, peer_id: &str) -> Self {
        Self {
            file_hash: file_hash.to_string(),
            job_id: uuid::Uuid::new_v4().to_string(),
            time_queued: Utc::now(),
            status: JobStatus::Queued,
            accumulated_cost: 0,
            projected_cost: 0,
            eta: 0,
            peer_id: peer_id.to_string(),
            last_error: None,
            next_chunk: 0,
            bytes_received: 0,
            max_chunks: 0,
            price_per_chunk: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    JobNotFound(String),
}

struct JobTable {
    jobs: Vec<Job>,
    version: u64,
    saved_version: u64,
}

impl JobTable {
    fn find_mut(&mut self, id: &str) -> Result<&mut Job, JobError> {
        self.jobs
            .iter_mut()
            .find(|j| j.job_id == id)
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))
    }

    fn is_dirty(&self) -> bool {
        self.version != self.saved_version
    }
}

/// Owner of every job on this node. Construct once and share behind `Arc`.
pub struct JobManager {
    table: Mutex<JobTable>,
    history_path: PathBuf,
    changes: watch::Sender<u64>,
}

impl JobManager {
    /// Empty manager persisting to `history_path`.
    pub fn new(history_path: impl Into<PathBuf>) -> Self {
        Self::with_jobs(history_path.into(), Vec::new())
    }

    /// Load persisted history. A missing file yields an empty manager.
    ///
    /// Jobs that were active when the daemon stopped come back paused.
    pub async fn load(history_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = history_path.into();
        let mut jobs: Vec<Job> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse job history {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        for job in &mut jobs {
            if job.status == JobStatus::Active {
                job.status = JobStatus::Paused;
            }
        }
        tracing::info!(jobs = jobs.len(), path = %path.display(), "job history loaded");
        Ok(Self::with_jobs(path, jobs))
    }

    fn with_jobs(history_path: PathBuf, jobs: Vec<Job>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            table: Mutex::new(JobTable {
                jobs,
                version: 0,
                saved_version: 0,
            }),
            history_path,
            changes,
        }
    }

    /// Receiver that ticks on every job mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self, table: &mut JobTable) {
        table.version += 1;
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub async fn find_job(&self, id: &str) -> Result<Job, JobError> {
        let table = self.table.lock().await;
        table
            .jobs
            .iter()
            .find(|j| j.job_id == id)
            .cloned()
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Job> {
        self.table.lock().await.jobs.clone()
    }

    /// Most recent job for `file_hash` served by `peer_id`.
    pub async fn find_by_peer(&self, file_hash: &str, peer_id: &str) -> Option<Job> {
        let table = self.table.lock().await;
        table
            .jobs
            .iter()
            .rev()
            .find(|j| j.file_hash == file_hash && j.peer_id == peer_id)
            .cloned()
    }

    pub async fn is_dirty(&self) -> bool {
        self.table.lock().await.is_dirty()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Queue a download. Returns the new job.
    pub async fn add_job(&self, file_hash: &str, peer_id: &str) -> Job {
        let job = Job::new(file_hash, peer_id);
        let mut table = self.table.lock().await;
        table.jobs.push(job.clone());
        self.notify(&mut table);
        tracing::info!(job_id = %job.job_id, file_hash, "job queued");
        job
    }

    /// Queued or paused → active. Anything else is left alone.
    pub async fn start_job(&self, id: &str) -> Result<JobStatus, JobError> {
        self.transition(id, &[JobStatus::Queued, JobStatus::Paused], JobStatus::Active)
            .await
    }

    /// Queued or active → paused.
    pub async fn pause_job(&self, id: &str) -> Result<JobStatus, JobError> {
        self.transition(id, &[JobStatus::Queued, JobStatus::Active], JobStatus::Paused)
            .await
    }

    /// Any non-terminal state → terminated, with [`TERMINATED_BY_REQUEST`] as the cause.
    pub async fn terminate_job(&self, id: &str) -> Result<JobStatus, JobError> {
        self.mark_failed(id, JobStatus::Terminated, TERMINATED_BY_REQUEST.to_string())
            .await?;
        Ok(self.find_job(id).await?.status)
    }

    /// Move to `to` if the job is in one of `from`. Returns the resulting status.
    async fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<JobStatus, JobError> {
        let mut table = self.table.lock().await;
        let job = table.find_mut(id)?;
        let prev = job.status;
        if prev == to || !from.contains(&prev) {
            return Ok(prev);
        }
        job.status = to;
        self.notify(&mut table);
        tracing::info!(job_id = %id, from = %prev, to = %to, "job status changed");
        Ok(to)
    }

    /// Active job completed its last chunk.
    pub async fn mark_finished(&self, id: &str) -> Result<(), JobError> {
        let mut table = self.table.lock().await;
        let job = table.find_mut(id)?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.status = JobStatus::Finished;
        job.eta = 0;
        self.notify(&mut table);
        tracing::info!(job_id = %id, "job finished");
        Ok(())
    }

    /// Record a failure. Jobs already in a terminal state keep theirs.
    pub async fn mark_failed(
        &self,
        id: &str,
        status: JobStatus,
        error: String,
    ) -> Result<(), JobError> {
        let mut table = self.table.lock().await;
        let job = table.find_mut(id)?;
        if job.status.is_terminal() {
            return Ok(());
        }
        let prev = job.status;
        job.status = status;
        job.last_error = Some(error.clone());
        self.notify(&mut table);
        tracing::info!(job_id = %id, from = %prev, to = %status, error = %error, "job status changed");
        Ok(())
    }

    // ── Accounting ────────────────────────────────────────────────────────────

    /// Add a paid chunk's cost. Ignored once the job is terminated.
    ///
    /// Returns whether the cost was applied.
    pub async fn update_job_cost(&self, id: &str, delta: u64) -> Result<bool, JobError> {
        let mut table = self.table.lock().await;
        let job = table.find_mut(id)?;
        if job.status == JobStatus::Terminated {
            return Ok(false);
        }
        job.accumulated_cost = job.accumulated_cost.saturating_add(delta);
        self.notify(&mut table);
        Ok(true)
    }

    /// Pin the holder and price a job is being served by.
    pub async fn set_route(&self, id: &str, peer_id: &str, price: u64) -> Result<(), JobError> {
        let mut table = self.table.lock().await;
        let job = table.find_mut(id)?;
        job.peer_id = peer_id.to_string();
        job.price_per_chunk = price;
        job.projected_cost = price.saturating_mul(job.max_chunks);
        self.notify(&mut table);
        Ok(())
    }

    /// Advance the resume point after a chunk is stored.
    ///
    /// `bytes_received` is the download's length up to `next_chunk`; a resumed
    /// transfer cuts the file back to it before appending.
    pub async fn record_progress(
        &self,
        id: &str,
        next_chunk: u64,
        max_chunks: u64,
        bytes_received: u64,
        eta_secs: u64,
    ) -> Result<(), JobError> {
        let mut table = self.table.lock().await;
        let job = table.find_mut(id)?;
        job.next_chunk = next_chunk;
        job.bytes_received = bytes_received;
        job.max_chunks = max_chunks;
        job.projected_cost = job.price_per_chunk.saturating_mul(max_chunks);
        job.eta = eta_secs;
        self.notify(&mut table);
        Ok(())
    }

    // ── History ───────────────────────────────────────────────────────────────

    /// Drop one job regardless of its status.
    pub async fn remove_from_history(&self, id: &str) -> Result<Job, JobError> {
        let mut table = self.table.lock().await;
        let pos = table
            .jobs
            .iter()
            .position(|j| j.job_id == id)
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        let job = table.jobs.remove(pos);
        self.notify(&mut table);
        Ok(job)
    }

    /// Drop every finished job. Returns how many were removed.
    pub async fn clear_history(&self) -> usize {
        let mut table = self.table.lock().await;
        let before = table.jobs.len();
        table.jobs.retain(|j| j.status != JobStatus::Finished);
        let removed = before - table.jobs.len();
        self.notify(&mut table);
        removed
    }

    // ── Waiting ───────────────────────────────────────────────────────────────

    /// Block while the job is queued or paused, then return its status.
    ///
    /// Wakes on any job change; `fallback` bounds each wait in case a
    /// notification is missed.
    pub async fn wait_until_runnable(
        &self,
        id: &str,
        fallback: Duration,
    ) -> Result<JobStatus, JobError> {
        let mut changes = self.changes.subscribe();
        let mut logged = false;
        loop {
            changes.borrow_and_update();
            let status = self.find_job(id).await?.status;
            if !matches!(status, JobStatus::Queued | JobStatus::Paused) {
                return Ok(status);
            }
            if !logged {
                tracing::debug!(job_id = %id, status = %status, "transfer waiting to resume");
                logged = true;
            }
            let _ = tokio::time::timeout(fallback, changes.changed()).await;
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Write the table if it changed since the last save. Returns whether it wrote.
    ///
    /// The dirty state only clears when the write succeeds.
    pub async fn save(&self) -> anyhow::Result<bool> {
        let (snapshot, version) = {
            let table = self.table.lock().await;
            if !table.is_dirty() {
                return Ok(false);
            }
            (table.jobs.clone(), table.version)
        };

        write_history(&self.history_path, &snapshot).await?;

        let mut table = self.table.lock().await;
        table.saved_version = table.saved_version.max(version);
        tracing::debug!(jobs = snapshot.len(), "job history saved");
        Ok(true)
    }

    /// Periodic saver. Saves one last time on shutdown.
    pub async fn run_saver(self: Arc<Self>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    if let Err(e) = self.save().await {
                        tracing::warn!(error = %e, "final job history save failed");
                    }
                    tracing::info!("job saver shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.save().await {
                        tracing::warn!(error = %e, "job history save failed, retrying next tick");
                    }
                }
            }
        }
    }
}

async fn write_history(path: &Path, jobs: &[Job]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(jobs)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}
