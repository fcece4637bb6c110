//! Orca integration test harness.
//!
//! Every test builds its nodes in-process: they share one replicated DHT
//! and talk chunk transfer over real loopback TCP. Nothing outside the
//! temp dir is touched, so tests run in parallel.
//!
//!   cargo test --test integration

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use orca_core::crypto::Identity;
use orca_services::{
    ChunkStore, Dht, FileManifest, Job, JobManager, JobRunner, JobStatus, LedgerPayments,
    LocalHolder, MarketService, MarketValidator, MemoryDht, PaymentError, PaymentGateway,
    RunnerSettings,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

mod api;
mod control;
mod downloads;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("orca-it-{tag}-{}-{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 251) as u8).collect()
}

pub fn network() -> MemoryDht {
    MemoryDht::new(3, Arc::new(MarketValidator::new()))
}

/// A node sharing one file on a loopback transfer port.
pub struct Producer {
    pub identity: Arc<Identity>,
    pub manifest: FileManifest,
    pub port: u16,
    _shutdown: broadcast::Sender<()>,
}

pub async fn producer(net: &MemoryDht, data: &[u8], chunk_size: usize, price: u64) -> Producer {
    let src = temp_dir("share");
    let path = src.join("shared.bin");
    std::fs::write(&path, data).unwrap();
    let store = ChunkStore::new(temp_dir("chunks"), chunk_size).unwrap();
    let manifest = store.import(&path).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown, _) = broadcast::channel::<()>(1);
    tokio::spawn(orca_services::run_listener(
        listener,
        store,
        shutdown.subscribe(),
    ));

    let identity = Arc::new(Identity::generate());
    let market = MarketService::new(Arc::new(net.clone()));
    let holder = LocalHolder {
        identity: identity.clone(),
        ip: "127.0.0.1".into(),
        port,
        price,
    };
    market.register_local(&holder, &manifest).await.unwrap();

    Producer {
        identity,
        manifest,
        port,
        _shutdown: shutdown,
    }
}

/// Appends to a ledger after a fixed delay, so transfers are slow enough to
/// be paused or terminated part way.
pub struct SlowPayments {
    pub ledger: LedgerPayments,
    pub delay: Duration,
}

#[async_trait]
impl PaymentGateway for SlowPayments {
    async fn pay(&self, amount: u64, recipient: &str, auth_token: &str) -> Result<(), PaymentError> {
        tokio::time::sleep(self.delay).await;
        self.ledger.pay(amount, recipient, auth_token).await
    }
}

/// A downloading node.
pub struct Consumer {
    pub work: PathBuf,
    pub jobs: Arc<JobManager>,
    pub market: Arc<MarketService>,
    pub runner: JobRunner,
    pub ledger_path: PathBuf,
}

pub async fn consumer(net: &MemoryDht, pay_delay: Duration) -> Consumer {
    let work = temp_dir("consumer");
    let jobs = Arc::new(JobManager::new(work.join("jobs.json")));
    consumer_with_jobs(net, work, jobs, pay_delay)
}

pub fn consumer_with_jobs(
    net: &MemoryDht,
    work: PathBuf,
    jobs: Arc<JobManager>,
    pay_delay: Duration,
) -> Consumer {
    let ledger_path = work.join("ledger.jsonl");
    let payments = Arc::new(SlowPayments {
        ledger: LedgerPayments::new(&ledger_path),
        delay: pay_delay,
    });
    let market = Arc::new(MarketService::new(Arc::new(net.clone())));
    let mut settings = RunnerSettings::new(work.join("downloads"), "token");
    settings.pause_poll = Duration::from_millis(50);
    let runner = JobRunner::new(jobs.clone(), market.clone(), payments, settings);
    Consumer {
        work,
        jobs,
        market,
        runner,
        ledger_path,
    }
}

impl Consumer {
    pub fn downloaded(&self, file_hash: &str) -> Vec<u8> {
        std::fs::read(self.runner.destination(file_hash)).unwrap_or_default()
    }

    pub fn ledger_lines(&self) -> usize {
        std::fs::read_to_string(&self.ledger_path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

/// Poll until `pred` holds for the job, or fail after ~10s.
pub async fn wait_until(
    jobs: &JobManager,
    id: &str,
    what: &str,
    pred: impl Fn(&Job) -> bool,
) -> Result<Job> {
    for _ in 0..400 {
        let job = jobs.find_job(id).await?;
        if pred(&job) {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    bail!("job {id} never became {what}")
}

pub async fn wait_for_status(jobs: &JobManager, id: &str, status: JobStatus) -> Result<Job> {
    wait_until(jobs, id, status.as_str(), |j| j.status == status).await
}

pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Whether `peer_id` is in the shared routing table.
pub async fn routing_has(net: &MemoryDht, peer_id: &str) -> bool {
    net.find_peer(peer_id).await.is_ok()
}
