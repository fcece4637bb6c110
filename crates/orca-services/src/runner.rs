//! Job runner: turns started jobs into transfer tasks.
//!
//! At most one task runs per job. A task resolves its holder through the
//! market, connects, and runs the chunk loop until the job finishes or
//! fails. Pausing does not end the task; it parks inside the loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use orca_core::record::HolderEntry;
use orca_core::wire::TRANSFER_TIMEOUT;
use tokio::net::TcpStream;

use crate::directory::PeerDirectory;
use crate::jobs::{JobError, JobManager, JobStatus};
use crate::market::MarketService;
use crate::payment::PaymentGateway;
use crate::transfer::{TransferClient, TransferError};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub download_dir: PathBuf,
    pub auth_token: String,
    pub pause_poll: Duration,
    /// Bound on connecting and on each chunk round trip.
    pub timeout: Duration,
}

impl RunnerSettings {
    pub fn new(download_dir: impl Into<PathBuf>, auth_token: impl Into<String>) -> Self {
        Self {
            download_dir: download_dir.into(),
            auth_token: auth_token.into(),
            pause_poll: Duration::from_secs(1),
            timeout: TRANSFER_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct JobRunner {
    jobs: Arc<JobManager>,
    market: Arc<MarketService>,
    client: TransferClient,
    directory: Option<Arc<PeerDirectory>>,
    download_dir: PathBuf,
    timeout: Duration,
    running: Arc<DashSet<String>>,
}

/// Drops the job from the running set when its task ends, however it ends.
struct RunningGuard {
    running: Arc<DashSet<String>>,
    job_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

impl JobRunner {
    pub fn new(
        jobs: Arc<JobManager>,
        market: Arc<MarketService>,
        payments: Arc<dyn PaymentGateway>,
        settings: RunnerSettings,
    ) -> Self {
        let client = TransferClient::new(
            jobs.clone(),
            payments,
            settings.auth_token,
            settings.pause_poll,
        )
        .with_timeout(settings.timeout);
        Self {
            jobs,
            market,
            client,
            directory: None,
            download_dir: settings.download_dir,
            timeout: settings.timeout,
            running: Arc::new(DashSet::new()),
        }
    }

    /// Track open streams per peer in `directory`.
    pub fn with_directory(mut self, directory: Arc<PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.contains(job_id)
    }

    /// Where a job's file is assembled.
    pub fn destination(&self, file_hash: &str) -> PathBuf {
        self.download_dir.join(file_hash)
    }

    /// Mark each job active and spawn its transfer unless one is already running.
    ///
    /// Returns one error per id that could not be started.
    pub async fn start_jobs(&self, ids: &[String]) -> Vec<JobError> {
        let mut errors = Vec::new();
        for id in ids {
            match self.jobs.start_job(id).await {
                Ok(JobStatus::Active) => self.spawn(id),
                Ok(_) => {}
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    fn spawn(&self, id: &str) {
        if !self.running.insert(id.to_string()) {
            return;
        }
        let guard = RunningGuard {
            running: self.running.clone(),
            job_id: id.to_string(),
        };
        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            this.run_job(&id).await;
        });
    }

    async fn run_job(&self, id: &str) {
        match self.drive(id).await {
            Ok(chunks) => tracing::info!(job_id = %id, chunks, "download complete"),
            Err(TransferError::JobTerminated) => {
                tracing::info!(job_id = %id, "transfer stopped by termination");
            }
            Err(e) => {
                let status = match e {
                    TransferError::LocalWrite(_) => JobStatus::Error,
                    _ => JobStatus::Terminated,
                };
                tracing::warn!(job_id = %id, error = %e, "transfer failed");
                if let Err(e) = self.jobs.mark_failed(id, status, e.to_string()).await {
                    tracing::debug!(job_id = %id, error = %e, "failed job already gone");
                }
            }
        }
    }

    async fn drive(&self, id: &str) -> Result<u64, TransferError> {
        let job = self
            .jobs
            .find_job(id)
            .await
            .map_err(|_| TransferError::JobTerminated)?;
        let holder = self.resolve_holder(&job.file_hash, &job.peer_id).await?;
        let peer_id = holder.peer_id();
        self.jobs
            .set_route(id, &peer_id, holder.price)
            .await
            .map_err(|_| TransferError::JobTerminated)?;

        let addr = format!("{}:{}", holder.ip, holder.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransferError::TransferTimeout(1))??;
        tracing::debug!(job_id = %id, peer = %peer_id, %addr, "connected to holder");

        // Re-read for the resume point and price just pinned.
        let job = self
            .jobs
            .find_job(id)
            .await
            .map_err(|_| TransferError::JobTerminated)?;
        let dest = self.destination(&job.file_hash);

        if let Some(dir) = &self.directory {
            dir.stream_opened(&peer_id).await;
        }
        let outcome = self.client.fetch(stream, &job, &holder, &dest).await;
        if let Some(dir) = &self.directory {
            dir.stream_closed(&peer_id).await;
        }
        outcome
    }

    /// The holder named by `peer_id`, or the cheapest one when it is empty.
    async fn resolve_holder(
        &self,
        file_hash: &str,
        peer_id: &str,
    ) -> Result<HolderEntry, TransferError> {
        let holders = self.market.lookup_ranked(file_hash).await?;
        let found = if peer_id.is_empty() {
            holders.into_iter().next()
        } else {
            holders.into_iter().find(|h| h.peer_id() == peer_id)
        };
        found.ok_or_else(|| TransferError::NoHolder(file_hash.to_string()))
    }
}
