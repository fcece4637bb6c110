//! Periodic re-announce of every locally shared file.
//!
//! Registration is last-writer-wins at the DHT, so a holder dropped by a
//! concurrent merge comes back at the next round.

use std::sync::Arc;
use std::time::Duration;

use orca_services::{ChunkStore, LocalHolder, MarketService};
use tokio::sync::broadcast;

pub async fn run(
    market: Arc<MarketService>,
    store: ChunkStore,
    holder: LocalHolder,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => announce_all(&market, &store, &holder).await,
        }
    }
}

async fn announce_all(market: &MarketService, store: &ChunkStore, holder: &LocalHolder) {
    let manifests = store.manifests();
    let mut ok = 0usize;
    for manifest in &manifests {
        match market.register_local(holder, manifest).await {
            Ok(()) => ok += 1,
            Err(e) => tracing::warn!(
                file_hash = %manifest.file_hash,
                error = %e,
                "announce failed"
            ),
        }
    }
    tracing::debug!(announced = ok, shared = manifests.len(), "announce round");
}
