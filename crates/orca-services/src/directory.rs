//! Peer directory: what this node knows about the peers in its routing table.
//!
//! A crawl copies new peer ids out of the DHT and inserts bare entries.
//! Location and latency are filled in later by one probe task per peer. The
//! table lock is only held to read or write an entry; probes copy the
//! connection string out, release the lock, do their I/O, and re-lock to
//! store the result.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};

use crate::dht::Dht;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    /// `host:port` the peer is reachable at.
    pub connection: String,
    /// Empty until geolocated.
    pub location: String,
    /// Connect round trip in milliseconds, once probed.
    #[serde(rename = "latency")]
    pub latency_ms: Option<u64>,
    pub open_streams: u32,
}

#[async_trait]
pub trait PeerProber: Send + Sync {
    /// Human-readable location for an IP, if known.
    async fn locate(&self, ip: &str) -> Option<String>;

    /// Round trip to `addr`, if reachable.
    async fn latency(&self, addr: &str) -> Option<Duration>;
}

/// Probes over the real network. Latency is a TCP connect; location comes
/// from ipinfo.io when enabled.
pub struct NetProber {
    timeout: Duration,
    geolocate: bool,
    http: reqwest::Client,
}

impl NetProber {
    pub fn new(timeout: Duration, geolocate: bool) -> Self {
        Self {
            timeout,
            geolocate,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct IpInfo {
    #[serde(default)]
    city: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    country: String,
}

#[async_trait]
impl PeerProber for NetProber {
    async fn locate(&self, ip: &str) -> Option<String> {
        if !self.geolocate {
            return None;
        }
        let url = format!("https://ipinfo.io/{ip}/json");
        let resp = tokio::time::timeout(self.timeout, self.http.get(&url).send())
            .await
            .ok()?
            .map_err(|e| tracing::debug!(ip, error = %e, "location probe failed"))
            .ok()?;
        let info: IpInfo = resp.json().await.ok()?;
        let parts: Vec<_> = [info.city, info.region, info.country]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(", "))
    }

    async fn latency(&self, addr: &str) -> Option<Duration> {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Some(start.elapsed()),
            Ok(Err(e)) => {
                tracing::debug!(addr, error = %e, "latency probe failed");
                None
            }
            Err(_) => {
                tracing::debug!(addr, "latency probe timed out");
                None
            }
        }
    }
}

/// The peer table. Construct once and share behind `Arc`.
pub struct PeerDirectory {
    peers: Mutex<HashMap<String, PeerInfo>>,
    dht: Arc<dyn Dht>,
    prober: Arc<dyn PeerProber>,
}

impl PeerDirectory {
    pub fn new(dht: Arc<dyn Dht>, prober: Arc<dyn PeerProber>) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            dht,
            prober,
        }
    }

    /// Insert every routing-table peer not yet known and spawn its probe.
    /// Returns the ids that were new.
    pub async fn crawl_once(self: &Arc<Self>) -> Vec<String> {
        let mut fresh = Vec::new();
        for peer_id in self.dht.list_peers().await {
            if self.peers.lock().await.contains_key(&peer_id) {
                continue;
            }
            let connection = match self.dht.find_peer(&peer_id).await {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::debug!(peer = %peer_id, error = %e, "peer not resolvable");
                    continue;
                }
            };

            let inserted = {
                let mut peers = self.peers.lock().await;
                if peers.contains_key(&peer_id) {
                    false
                } else {
                    peers.insert(
                        peer_id.clone(),
                        PeerInfo {
                            peer_id: peer_id.clone(),
                            connection,
                            ..PeerInfo::default()
                        },
                    );
                    true
                }
            };
            if !inserted {
                continue;
            }

            tracing::debug!(peer = %peer_id, "peer discovered");
            let this = self.clone();
            let id = peer_id.clone();
            tokio::spawn(async move { this.enrich(&id).await });
            fresh.push(peer_id);
        }
        fresh
    }

    /// Probe one peer and store location and latency.
    pub async fn enrich(&self, peer_id: &str) {
        let Some(connection) = self
            .peers
            .lock()
            .await
            .get(peer_id)
            .map(|p| p.connection.clone())
        else {
            return;
        };
        let ip = host_of(&connection);

        let location = self.prober.locate(ip).await;
        let latency = self.prober.latency(&connection).await;

        let mut peers = self.peers.lock().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            if let Some(loc) = location {
                peer.location = loc;
            }
            peer.latency_ms = latency.map(|d| d.as_millis() as u64);
        }
    }

    /// Crawl every `every` until shutdown.
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("peer directory shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let fresh = self.crawl_once().await;
                    if !fresh.is_empty() {
                        tracing::debug!(new = fresh.len(), "directory crawl");
                    }
                }
            }
        }
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.lock().await.get(peer_id).cloned()
    }

    /// All peers, sorted by id.
    pub async fn list(&self) -> Vec<PeerInfo> {
        let mut all: Vec<_> = self.peers.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    /// Forget a peer. Returns whether it was known.
    pub async fn remove(&self, peer_id: &str) -> bool {
        self.peers.lock().await.remove(peer_id).is_some()
    }

    pub async fn stream_opened(&self, peer_id: &str) {
        if let Some(p) = self.peers.lock().await.get_mut(peer_id) {
            p.open_streams += 1;
        }
    }

    pub async fn stream_closed(&self, peer_id: &str) {
        if let Some(p) = self.peers.lock().await.get_mut(peer_id) {
            p.open_streams = p.open_streams.saturating_sub(1);
        }
    }

    /// Write the table as a JSON array.
    pub async fn save_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = self.list().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&snapshot)?)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Merge a saved snapshot into the table. A missing file is not an error.
    ///
    /// Open stream counts are reset; they describe a previous run.
    pub async fn load_snapshot(&self, path: &Path) -> anyhow::Result<usize> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let saved: Vec<PeerInfo> = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let mut peers = self.peers.lock().await;
        let count = saved.len();
        for mut p in saved {
            p.open_streams = 0;
            peers.entry(p.peer_id.clone()).or_insert(p);
        }
        Ok(count)
    }
}

/// Host part of `host:port` (brackets stripped for IPv6).
fn host_of(connection: &str) -> &str {
    let host = connection
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(connection);
    host.trim_start_matches('[').trim_end_matches(']')
}
