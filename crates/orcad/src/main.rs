//! orcad: file market daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use orca_core::config::OrcaConfig;
use orca_core::crypto::Identity;
use orca_core::wire::TRANSFER_TIMEOUT;
use orca_services::{
    ChunkStore, Dht, JobManager, JobRunner, KadDht, LedgerPayments, LocalHolder, MarketService,
    MarketValidator, NetProber, PeerDirectory, RunnerSettings,
};

mod announce;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = OrcaConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = OrcaConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        OrcaConfig::default()
    });
    tracing::info!(
        transfer_port = config.network.transfer_port,
        api_port = config.network.api_port,
        "orcad starting"
    );

    // Identity
    let identity = Arc::new(
        Identity::load_or_generate(&config.identity.keypair_path)
            .context("failed to load identity")?,
    );
    tracing::info!(peer_id = %identity.peer_id(), "identity ready");

    // DHT + market
    let dht = KadDht::spawn(
        &identity,
        &format!("{}:{}", config.network.bind_addr, config.network.dht_port),
        Arc::new(MarketValidator::new()),
        TRANSFER_TIMEOUT,
    )
    .await
    .context("failed to start DHT node")?;
    tracing::info!(contact = %dht.contact(), "DHT node ready");
    if !config.network.bootstrap_peers.is_empty() {
        match dht.bootstrap(&config.network.bootstrap_peers).await {
            Ok(n) => tracing::info!(peers = n, "bootstrapped"),
            Err(e) => tracing::warn!(error = %e, "bootstrap failed"),
        }
    }
    let dht: Arc<dyn Dht> = Arc::new(dht);
    let market = Arc::new(MarketService::new(dht.clone()));

    // Jobs
    let jobs = match JobManager::load(&config.jobs.history_path).await {
        Ok(jobs) => jobs,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load job history, starting empty");
            JobManager::new(&config.jobs.history_path)
        }
    };
    let jobs = Arc::new(jobs);
    let payments = Arc::new(LedgerPayments::new(&config.payment.ledger_path));

    // Chunk store
    let store = ChunkStore::new(&config.storage.chunk_root, config.storage.chunk_size)?;
    std::fs::create_dir_all(&config.storage.shared_dir).with_context(|| {
        format!(
            "failed to create shared dir {}",
            config.storage.shared_dir.display()
        )
    })?;
    match store.import_dir(&config.storage.shared_dir) {
        Ok(shared) => tracing::info!(files = shared.len(), "shared files imported"),
        Err(e) => tracing::warn!(error = %e, "failed to import shared files"),
    }

    // Peer directory
    let directory = Arc::new(PeerDirectory::new(
        dht.clone(),
        Arc::new(NetProber::new(
            Duration::from_secs(config.directory.probe_timeout_secs),
            config.directory.geolocate,
        )),
    ));
    if let Err(e) = directory
        .load_snapshot(&config.directory.snapshot_path)
        .await
    {
        tracing::warn!(error = %e, "failed to load peer snapshot");
    }

    // Runner
    let mut settings =
        RunnerSettings::new(&config.storage.download_dir, &config.payment.auth_token);
    settings.pause_poll = Duration::from_millis(config.jobs.pause_poll_ms);
    let runner = JobRunner::new(jobs.clone(), market.clone(), payments, settings)
        .with_directory(directory.clone());

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener = TcpListener::bind((
        config.network.bind_addr.as_str(),
        config.network.transfer_port,
    ))
    .await
    .context("failed to bind transfer listener")?;
    tracing::info!(addr = %listener.local_addr()?, "transfer listener bound");
    let listener_task = tokio::spawn(orca_services::run_listener(
        listener,
        store.clone(),
        shutdown_tx.subscribe(),
    ));

    let saver_task = tokio::spawn(jobs.clone().run_saver(
        Duration::from_secs(config.jobs.save_interval_secs),
        shutdown_tx.subscribe(),
    ));

    let crawl_task = tokio::spawn(directory.clone().run(
        Duration::from_secs(config.directory.crawl_interval_secs),
        shutdown_tx.subscribe(),
    ));

    let announce_task = tokio::spawn(announce::run(
        market.clone(),
        store.clone(),
        LocalHolder {
            identity: identity.clone(),
            ip: config.advertised_ip().to_string(),
            port: config.network.transfer_port,
            price: config.market.price_per_chunk,
        },
        Duration::from_secs(config.market.announce_interval_secs),
        shutdown_tx.subscribe(),
    ));

    let api_task = {
        let state = orca_api::ApiState {
            jobs: jobs.clone(),
            runner,
            market,
            store,
            directory: directory.clone(),
        };
        let port = config.network.api_port;
        tokio::spawn(async move {
            if let Err(e) = orca_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = listener_task      => tracing::error!("transfer listener exited: {:?}", r),
        r = saver_task         => tracing::error!("job saver exited: {:?}", r),
        r = crawl_task         => tracing::error!("directory crawl exited: {:?}", r),
        r = announce_task      => tracing::error!("announcer exited: {:?}", r),
        r = api_task           => tracing::error!("API server exited: {:?}", r),
    }

    if let Err(e) = jobs.save().await {
        tracing::warn!(error = %e, "final job save failed");
    }
    if let Err(e) = directory
        .save_snapshot(&config.directory.snapshot_path)
        .await
    {
        tracing::warn!(error = %e, "failed to save peer snapshot");
    }

    Ok(())
}
