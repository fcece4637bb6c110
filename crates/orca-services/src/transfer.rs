//! Chunk transfer: consumer pull loop and producer stream server.
//!
//! The consumer drives: it names the file with the protocol-id frame, then
//! asks for chunks strictly in order from the job's resume point, pays for
//! each one, and appends it to the file being assembled. Pause and
//! termination are observed between chunks, never mid-request.
//!
//! A producer asked for an index past the end answers with an empty
//! response carrying the real `maxChunkCount`, then closes the stream.
//!
//! The per-request deadline only covers the wait for a response to begin.
//! A response that has started is read to the end under a longer stall
//! bound, so a timed-out request can be retried on the same stream.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use orca_core::record::HolderEntry;
use orca_core::wire::{
    self, ChunkRequest, ChunkResponse, FrameError, FRAME_STALL_TIMEOUT, MAX_CONSECUTIVE_TIMEOUTS,
    TRANSFER_TIMEOUT,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::chunk_store::ChunkStore;
use crate::jobs::{Job, JobManager, JobStatus};
use crate::market::MarketError;
use crate::payment::{PaymentError, PaymentGateway};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("chunk {index} out of range, file has {max} chunks")]
    ChunkIndexOutOfRange { index: u64, max: u64 },

    #[error("no response after {0} attempts")]
    TransferTimeout(u32),

    #[error("job terminated")]
    JobTerminated,

    #[error("payment failed: {0}")]
    PaymentFailed(#[from] PaymentError),

    #[error("file {0} is not shared here")]
    UnknownFile(String),

    #[error("no holder for file {0}")]
    NoHolder(String),

    #[error("market lookup failed: {0}")]
    Market(#[from] MarketError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transfer I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The download file could not be written. Not the peer's fault.
    #[error("local write failed: {0}")]
    LocalWrite(std::io::Error),
}

impl From<FrameError> for TransferError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => Self::Io(io),
            FrameError::Closed => Self::Protocol("stream closed by peer".into()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

// ── Consumer ──────────────────────────────────────────────────────────────────

/// Drives one job's chunk loop over an established stream.
#[derive(Clone)]
pub struct TransferClient {
    jobs: Arc<JobManager>,
    payments: Arc<dyn PaymentGateway>,
    auth_token: String,
    pause_poll: Duration,
    timeout: Duration,
}

impl TransferClient {
    pub fn new(
        jobs: Arc<JobManager>,
        payments: Arc<dyn PaymentGateway>,
        auth_token: impl Into<String>,
        pause_poll: Duration,
    ) -> Self {
        Self {
            jobs,
            payments,
            auth_token: auth_token.into(),
            pause_poll,
            timeout: TRANSFER_TIMEOUT,
        }
    }

    /// Override how long a producer has to start answering a request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pull `job`'s file from `holder` into `dest`, starting at `job.next_chunk`.
    ///
    /// Returns the file's chunk count once the last chunk is stored and the
    /// job is marked finished. A download that cannot back the job's resume
    /// point starts over from chunk 0.
    pub async fn fetch<S>(
        &self,
        stream: S,
        job: &Job,
        holder: &HolderEntry,
        dest: &Path,
    ) -> Result<u64, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = job.job_id.as_str();
        let recipient = holder.peer_id();
        let (mut rd, mut wr) = tokio::io::split(stream);
        wire::write_frame(&mut wr, wire::protocol_id(&job.file_hash).as_bytes()).await?;

        let (mut out, mut next, mut received) = open_download(dest, job).await?;
        let mut timeouts = 0u32;

        loop {
            match self.jobs.wait_until_runnable(id, self.pause_poll).await {
                Ok(JobStatus::Active) => {}
                Ok(JobStatus::Terminated) | Err(_) => return Err(TransferError::JobTerminated),
                Ok(other) => {
                    return Err(TransferError::Protocol(format!("job is {other}")));
                }
            }

            let req = ChunkRequest {
                file_hash: job.file_hash.clone(),
                chunk_index: next,
                job_id: job.job_id.clone(),
            };
            let started = Instant::now();
            let Some(resp) = round_trip(&mut rd, &mut wr, &req, self.timeout).await? else {
                timeouts += 1;
                tracing::warn!(job_id = %id, chunk = next, attempt = timeouts, "chunk request timed out");
                if timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    return Err(TransferError::TransferTimeout(timeouts));
                }
                continue;
            };
            timeouts = 0;

            if resp.file_hash != job.file_hash {
                return Err(TransferError::Protocol(format!(
                    "response for file {}",
                    resp.file_hash
                )));
            }
            if resp.chunk_index >= resp.max_chunk_count {
                return Err(TransferError::ChunkIndexOutOfRange {
                    index: resp.chunk_index,
                    max: resp.max_chunk_count,
                });
            }

            if let Err(e) = self
                .payments
                .pay(holder.price, &recipient, &self.auth_token)
                .await
            {
                tracing::warn!(job_id = %id, chunk = next, error = %e, "chunk payment failed");
                return Err(e.into());
            }

            out.write_all(&resp.data)
                .await
                .map_err(TransferError::LocalWrite)?;
            out.flush().await.map_err(TransferError::LocalWrite)?;
            received += resp.data.len() as u64;

            let remaining = resp.max_chunk_count - next - 1;
            let eta = started.elapsed().as_secs_f64() * remaining as f64;
            self.jobs
                .update_job_cost(id, holder.price)
                .await
                .map_err(|_| TransferError::JobTerminated)?;
            self.jobs
                .record_progress(
                    id,
                    next + 1,
                    resp.max_chunk_count,
                    received,
                    eta.ceil() as u64,
                )
                .await
                .map_err(|_| TransferError::JobTerminated)?;
            tracing::debug!(job_id = %id, chunk = next, of = resp.max_chunk_count, bytes = resp.data.len(), "chunk received");

            if resp.is_last() {
                self.jobs
                    .mark_finished(id)
                    .await
                    .map_err(|_| TransferError::JobTerminated)?;
                return Ok(resp.max_chunk_count);
            }
            next += 1;
        }
    }
}

/// Open the download and return it with the chunk index and byte offset to resume at.
///
/// The file may hold chunks written after the job was last saved, so it is
/// cut back to `job.bytes_received` before appending. A file shorter than
/// that is started over.
async fn open_download(
    dest: &Path,
    job: &Job,
) -> Result<(tokio::fs::File, u64, u64), TransferError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(TransferError::LocalWrite)?;
    }

    if job.next_chunk > 0 && job.bytes_received > 0 {
        match tokio::fs::OpenOptions::new().append(true).open(dest).await {
            Ok(file) => {
                let len = file
                    .metadata()
                    .await
                    .map_err(TransferError::LocalWrite)?
                    .len();
                if len >= job.bytes_received {
                    if len > job.bytes_received {
                        tracing::debug!(job_id = %job.job_id, on_disk = len, kept = job.bytes_received, "dropping unrecorded tail of download");
                    }
                    file.set_len(job.bytes_received)
                        .await
                        .map_err(TransferError::LocalWrite)?;
                    return Ok((file, job.next_chunk, job.bytes_received));
                }
                tracing::warn!(job_id = %job.job_id, on_disk = len, expected = job.bytes_received, "download shorter than recorded progress, starting over");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(job_id = %job.job_id, "download file missing, starting over");
            }
            Err(e) => return Err(TransferError::LocalWrite(e)),
        }
    } else if job.next_chunk > 0 {
        tracing::warn!(job_id = %job.job_id, next_chunk = job.next_chunk, "no byte count for resume point, starting over");
    }

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest)
        .await
        .map_err(TransferError::LocalWrite)?;
    Ok((file, 0, 0))
}

/// Send `req` and wait for its response, skipping late answers to earlier requests.
///
/// `Ok(None)` means no response began within `timeout`. The stream is still
/// in sync then, so the caller may ask again.
async fn round_trip<S>(
    rd: &mut ReadHalf<S>,
    wr: &mut WriteHalf<S>,
    req: &ChunkRequest,
    timeout: Duration,
) -> Result<Option<ChunkResponse>, TransferError>
where
    S: AsyncRead + AsyncWrite,
{
    tokio::time::timeout(timeout, wire::write_json(wr, req))
        .await
        .map_err(|_| TransferError::Protocol("request write stalled".into()))??;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let first = match tokio::time::timeout_at(deadline, wire::read_frame_start(rd)).await {
            Ok(first) => first?,
            Err(_) => return Ok(None),
        };
        let payload = tokio::time::timeout(FRAME_STALL_TIMEOUT, wire::read_frame_rest(rd, first))
            .await
            .map_err(|_| TransferError::Protocol("response stalled mid-frame".into()))??;
        let resp: ChunkResponse = serde_json::from_slice(&payload).map_err(FrameError::from)?;
        if resp.chunk_index == req.chunk_index || resp.chunk_index >= resp.max_chunk_count {
            return Ok(Some(resp));
        }
        if resp.chunk_index > req.chunk_index {
            return Err(TransferError::Protocol(format!(
                "asked for chunk {}, got {}",
                req.chunk_index, resp.chunk_index
            )));
        }
        tracing::debug!(chunk = resp.chunk_index, "discarding stale response");
    }
}

// ── Producer ──────────────────────────────────────────────────────────────────

/// Serve one consumer stream until it closes. Returns the number of chunks sent.
pub async fn serve_stream<S>(stream: S, store: &ChunkStore) -> Result<u64, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(stream);

    let proto = wire::read_frame(&mut rd).await?;
    let proto = String::from_utf8(proto)
        .map_err(|_| TransferError::Protocol("protocol id is not utf-8".into()))?;
    let file_hash = wire::file_hash_from_protocol(&proto)
        .ok_or_else(|| TransferError::Protocol(format!("unknown protocol {proto:?}")))?
        .to_string();
    if store.manifest(&file_hash).is_none() {
        return Err(TransferError::UnknownFile(file_hash));
    }

    let mut served = 0u64;
    loop {
        let req: ChunkRequest = match wire::read_json(&mut rd).await {
            Ok(req) => req,
            Err(FrameError::Closed) => return Ok(served),
            Err(e) => return Err(e.into()),
        };
        if req.file_hash != file_hash {
            return Err(TransferError::Protocol(format!(
                "request for {} on stream for {file_hash}",
                req.file_hash
            )));
        }

        match store.load_chunk(&file_hash, req.chunk_index).await {
            Ok((data, max)) => {
                let resp = ChunkResponse {
                    file_hash: file_hash.clone(),
                    chunk_index: req.chunk_index,
                    max_chunk_count: max,
                    data: data.to_vec(),
                };
                wire::write_json(&mut wr, &resp).await?;
                served += 1;
            }
            Err(TransferError::ChunkIndexOutOfRange { index, max }) => {
                let resp = ChunkResponse {
                    file_hash: file_hash.clone(),
                    chunk_index: index,
                    max_chunk_count: max,
                    data: Vec::new(),
                };
                wire::write_json(&mut wr, &resp).await?;
                let _ = wr.shutdown().await;
                return Err(TransferError::ChunkIndexOutOfRange { index, max });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Accept consumer connections until shutdown, one task per stream.
pub async fn run_listener(
    listener: TcpListener,
    store: ChunkStore,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("transfer listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let store = store.clone();
                tokio::spawn(async move {
                    match serve_stream(stream, &store).await {
                        Ok(n) => tracing::debug!(%peer, chunks = n, "transfer stream closed"),
                        Err(e) => tracing::debug!(%peer, error = %e, "transfer stream ended"),
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::LedgerPayments;
    use async_trait::async_trait;
    use orca_core::crypto::Identity;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir(tag: &str) -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("orca-xfer-{tag}-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    struct Fixture {
        store: ChunkStore,
        file_hash: String,
        data: Vec<u8>,
        jobs: Arc<JobManager>,
        ledger: Arc<LedgerPayments>,
        holder: HolderEntry,
        dest: PathBuf,
    }

    fn fixture(len: usize, chunk: usize) -> Fixture {
        let src = temp_dir("src");
        let data = sample(len);
        let path = src.join("payload.bin");
        std::fs::write(&path, &data).unwrap();
        let store = ChunkStore::new(temp_dir("store"), chunk).unwrap();
        let file_hash = store.import(&path).unwrap().file_hash;
        let work = temp_dir("work");
        Fixture {
            store,
            file_hash,
            data,
            jobs: Arc::new(JobManager::new(work.join("jobs.json"))),
            ledger: Arc::new(LedgerPayments::new(work.join("ledger.jsonl"))),
            holder: HolderEntry {
                public_key: Identity::generate().public_bytes().to_vec(),
                ip: "127.0.0.1".into(),
                port: 0,
                price: 2,
            },
            dest: work.join("download.bin"),
        }
    }

    impl Fixture {
        fn client(&self) -> TransferClient {
            TransferClient::new(
                self.jobs.clone(),
                self.ledger.clone(),
                "token",
                Duration::from_secs(30),
            )
        }

        fn spawn_server(&self) -> tokio::io::DuplexStream {
            let (consumer, producer) = tokio::io::duplex(64 * 1024);
            let store = self.store.clone();
            tokio::spawn(async move {
                let _ = serve_stream(producer, &store).await;
            });
            consumer
        }
    }

    #[tokio::test]
    async fn full_download_is_byte_identical_and_paid_per_chunk() {
        let fx = fixture(10_000, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();
        fx.jobs
            .set_route(&job.job_id, &fx.holder.peer_id(), fx.holder.price)
            .await
            .unwrap();

        let chunks = fx
            .client()
            .fetch(fx.spawn_server(), &job, &fx.holder, &fx.dest)
            .await
            .unwrap();
        assert_eq!(chunks, 10);
        assert_eq!(std::fs::read(&fx.dest).unwrap(), fx.data);

        let done = fx.jobs.find_job(&job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Finished);
        assert_eq!(done.accumulated_cost, 20);
        assert_eq!(done.projected_cost, 20);
        assert_eq!(done.next_chunk, 10);

        let ledger = fx.ledger.entries().await.unwrap();
        assert_eq!(ledger.len(), 10);
        assert!(ledger.iter().all(|e| e.recipient == fx.holder.peer_id()));
    }

    #[tokio::test]
    async fn resume_appends_from_next_chunk() {
        let fx = fixture(4096, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();
        std::fs::write(&fx.dest, &fx.data[..2048]).unwrap();
        fx.jobs
            .record_progress(&job.job_id, 2, 4, 2048, 0)
            .await
            .unwrap();
        let job = fx.jobs.find_job(&job.job_id).await.unwrap();

        fx.client()
            .fetch(fx.spawn_server(), &job, &fx.holder, &fx.dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&fx.dest).unwrap(), fx.data);
        assert_eq!(fx.ledger.entries().await.unwrap().len(), 2);
        assert_eq!(
            fx.jobs.find_job(&job.job_id).await.unwrap().bytes_received,
            4096
        );
    }

    #[tokio::test]
    async fn resume_drops_chunks_written_after_last_save() {
        let fx = fixture(4096, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();
        // Three chunks on disk, but the saved history only covers two.
        std::fs::write(&fx.dest, &fx.data[..3072]).unwrap();
        fx.jobs
            .record_progress(&job.job_id, 2, 4, 2048, 0)
            .await
            .unwrap();
        let job = fx.jobs.find_job(&job.job_id).await.unwrap();

        fx.client()
            .fetch(fx.spawn_server(), &job, &fx.holder, &fx.dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&fx.dest).unwrap(), fx.data);
        assert_eq!(fx.ledger.entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resume_without_backing_file_starts_over() {
        let fx = fixture(4096, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();
        fx.jobs
            .record_progress(&job.job_id, 2, 4, 2048, 0)
            .await
            .unwrap();
        let job = fx.jobs.find_job(&job.job_id).await.unwrap();

        fx.client()
            .fetch(fx.spawn_server(), &job, &fx.holder, &fx.dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&fx.dest).unwrap(), fx.data);
        assert_eq!(fx.ledger.entries().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn out_of_range_start_writes_nothing() {
        let fx = fixture(2048, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();
        std::fs::write(&fx.dest, &fx.data).unwrap();
        fx.jobs
            .record_progress(&job.job_id, 2, 0, 2048, 0)
            .await
            .unwrap();
        let job = fx.jobs.find_job(&job.job_id).await.unwrap();

        let err = fx
            .client()
            .fetch(fx.spawn_server(), &job, &fx.holder, &fx.dest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::ChunkIndexOutOfRange { index: 2, max: 2 }
        ));
        assert_eq!(std::fs::read(&fx.dest).unwrap(), fx.data);
        assert!(fx.ledger.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_rejects_out_of_range_request() {
        let fx = fixture(1024, 1024);
        let (mut consumer, producer) = tokio::io::duplex(64 * 1024);
        let store = fx.store.clone();
        let server = tokio::spawn(async move { serve_stream(producer, &store).await });

        wire::write_frame(&mut consumer, wire::protocol_id(&fx.file_hash).as_bytes())
            .await
            .unwrap();
        let req = ChunkRequest {
            file_hash: fx.file_hash.clone(),
            chunk_index: 1,
            job_id: "j".into(),
        };
        wire::write_json(&mut consumer, &req).await.unwrap();
        let resp: ChunkResponse = wire::read_json(&mut consumer).await.unwrap();
        assert_eq!((resp.chunk_index, resp.max_chunk_count), (1, 1));
        assert!(resp.data.is_empty());

        assert!(matches!(
            server.await.unwrap(),
            Err(TransferError::ChunkIndexOutOfRange { index: 1, max: 1 })
        ));
    }

    #[tokio::test]
    async fn server_rejects_unknown_file() {
        let fx = fixture(16, 16);
        let (mut consumer, producer) = tokio::io::duplex(1024);
        wire::write_frame(&mut consumer, wire::protocol_id("ff").as_bytes())
            .await
            .unwrap();
        assert!(matches!(
            serve_stream(producer, &fx.store).await,
            Err(TransferError::UnknownFile(_))
        ));
    }

    #[tokio::test]
    async fn terminated_job_stops_before_next_request() {
        let fx = fixture(4096, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.terminate_job(&job.job_id).await.unwrap();

        let err = fx
            .client()
            .fetch(fx.spawn_server(), &job, &fx.holder, &fx.dest)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::JobTerminated));
        assert_eq!(std::fs::read(&fx.dest).unwrap().len(), 0);
        assert_eq!(fx.jobs.find_job(&job.job_id).await.unwrap().accumulated_cost, 0);
    }

    struct Refusing;

    #[async_trait]
    impl PaymentGateway for Refusing {
        async fn pay(&self, _: u64, _: &str, _: &str) -> Result<(), PaymentError> {
            Err(PaymentError::Rejected("insufficient funds".into()))
        }
    }

    #[tokio::test]
    async fn payment_failure_aborts_without_writing() {
        let fx = fixture(2048, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();

        let client = TransferClient::new(fx.jobs.clone(), Arc::new(Refusing), "t", Duration::from_secs(1));
        let err = client
            .fetch(fx.spawn_server(), &job, &fx.holder, &fx.dest)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::PaymentFailed(_)));
        assert!(std::fs::read(&fx.dest).unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_producer_times_out_after_three_attempts() {
        let fx = fixture(1024, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();

        // Reads everything, never answers.
        let (consumer, mut producer) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut producer, &mut tokio::io::sink()).await;
        });

        let err = fx
            .client()
            .with_timeout(Duration::from_millis(50))
            .fetch(consumer, &job, &fx.holder, &fx.dest)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TransferTimeout(3)));
    }

    #[tokio::test]
    async fn slow_response_body_is_read_to_the_end() {
        let fx = fixture(1000, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();

        // Starts the answer promptly, then stalls past the request deadline.
        let (consumer, producer) = tokio::io::duplex(64 * 1024);
        let store = fx.store.clone();
        let file_hash = fx.file_hash.clone();
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(producer);
            wire::read_frame(&mut rd).await.unwrap();
            let req: ChunkRequest = wire::read_json(&mut rd).await.unwrap();
            let (data, max) = store.chunk(&file_hash, req.chunk_index).unwrap();
            let resp = ChunkResponse {
                file_hash,
                chunk_index: req.chunk_index,
                max_chunk_count: max,
                data: data.to_vec(),
            };
            let payload = serde_json::to_vec(&resp).unwrap();
            let (head, tail) = payload.split_at(payload.len() / 2);
            wr.write_all(&(payload.len() as u32).to_le_bytes()).await.unwrap();
            wr.write_all(head).await.unwrap();
            wr.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            wr.write_all(tail).await.unwrap();
            wr.flush().await.unwrap();
            // Hold the stream open until the consumer is done with it.
            let _ = tokio::io::copy(&mut rd, &mut tokio::io::sink()).await;
        });

        let chunks = fx
            .client()
            .with_timeout(Duration::from_millis(50))
            .fetch(consumer, &job, &fx.holder, &fx.dest)
            .await
            .unwrap();
        assert_eq!(chunks, 1);
        assert_eq!(std::fs::read(&fx.dest).unwrap(), fx.data);
        assert_eq!(fx.ledger.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_answer_is_skipped_after_retry() {
        let fx = fixture(2048, 1024);
        let job = fx.jobs.add_job(&fx.file_hash, "").await;
        fx.jobs.start_job(&job.job_id).await.unwrap();

        // Answers the first request only after the consumer has given up on
        // it, so the retry sees a duplicate chunk 0 ahead of its own answer.
        let (consumer, producer) = tokio::io::duplex(64 * 1024);
        let store = fx.store.clone();
        let file_hash = fx.file_hash.clone();
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(producer);
            wire::read_frame(&mut rd).await.unwrap();
            let mut first = true;
            while let Ok(req) = wire::read_json::<_, ChunkRequest>(&mut rd).await {
                if first {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    first = false;
                }
                let (data, max) = store.chunk(&file_hash, req.chunk_index).unwrap();
                let resp = ChunkResponse {
                    file_hash: file_hash.clone(),
                    chunk_index: req.chunk_index,
                    max_chunk_count: max,
                    data: data.to_vec(),
                };
                if wire::write_json(&mut wr, &resp).await.is_err() {
                    break;
                }
            }
        });

        let chunks = fx
            .client()
            .with_timeout(Duration::from_millis(50))
            .fetch(consumer, &job, &fx.holder, &fx.dest)
            .await
            .unwrap();
        assert_eq!(chunks, 2);
        assert_eq!(std::fs::read(&fx.dest).unwrap(), fx.data);
        assert_eq!(fx.ledger.entries().await.unwrap().len(), 2);
    }
}
