//! DHT capability.
//!
//! The market only needs a key/value store with a validator hook and a
//! routing-table view of peers. [`Dht`] is that seam. The daemon runs
//! [`crate::KadDht`]. [`MemoryDht`] is the in-process implementation tests use: a set of replicas shared by every cloned
//! handle, where each handle may see only some of them. That is enough to
//! reproduce what the real network does to a record: writes land on the
//! replicas a node can reach, and readers arbitrate between diverging
//! copies with [`RecordValidator::select`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::validator::ValidationError;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("record rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("no reachable replicas")]
    Unreachable,

    #[error("peer {0} not in routing table")]
    PeerNotFound(String),

    #[error("bad bootstrap address {0:?}, expected peer_id@host:port")]
    BadBootstrapAddr(String),

    #[error("{0:?} is not a hex Ed25519 public key")]
    BadPeerId(String),

    #[error("DHT query timed out")]
    Timeout,

    #[error("DHT network error: {0}")]
    Network(String),
}

/// Extension point the DHT runs on every write and every multi-candidate read.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, key: &str, value: &[u8]) -> Result<(), ValidationError>;

    /// Index of the candidate to keep.
    fn select(&self, key: &str, candidates: &[Vec<u8>]) -> usize;
}

#[async_trait]
pub trait Dht: Send + Sync {
    /// Validate and store `value` under `key`.
    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<(), DhtError>;

    /// Best value for `key`, or `None` if no reachable replica has it.
    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, DhtError>;

    /// Seed the routing table from `peer_id@host:port` strings. Returns how many were added.
    async fn bootstrap(&self, peers: &[String]) -> Result<usize, DhtError>;

    /// Connection address (`host:port`) for a known peer.
    async fn find_peer(&self, peer_id: &str) -> Result<String, DhtError>;

    /// Peer ids in the local routing table.
    async fn list_peers(&self) -> Vec<String>;

    async fn add_peer(&self, peer_id: &str, addr: &str);
}

type Replica = Arc<DashMap<String, Vec<u8>>>;

/// In-process replicated record store.
#[derive(Clone)]
pub struct MemoryDht {
    replicas: Arc<Vec<Replica>>,
    reach: Arc<Vec<usize>>,
    validator: Arc<dyn RecordValidator>,
    routing: Arc<DashMap<String, String>>,
    online: Arc<AtomicBool>,
}

impl MemoryDht {
    /// A network of `replica_count` replicas, all reachable from this handle.
    pub fn new(replica_count: usize, validator: Arc<dyn RecordValidator>) -> Self {
        let replicas = (0..replica_count.max(1))
            .map(|_| Arc::new(DashMap::new()))
            .collect::<Vec<_>>();
        let reach = (0..replicas.len()).collect();
        Self {
            replicas: Arc::new(replicas),
            reach: Arc::new(reach),
            validator,
            routing: Arc::new(DashMap::new()),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Another node on the same network that can only reach `reach`.
    ///
    /// The new handle has its own routing table and online switch.
    pub fn partition(&self, reach: &[usize]) -> Self {
        let reach = reach
            .iter()
            .copied()
            .filter(|i| *i < self.replicas.len())
            .collect();
        Self {
            replicas: self.replicas.clone(),
            reach: Arc::new(reach),
            validator: self.validator.clone(),
            routing: Arc::new(DashMap::new()),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Raw copy held by one replica, bypassing selection.
    pub fn replica_value(&self, replica: usize, key: &str) -> Option<Vec<u8>> {
        self.replicas.get(replica)?.get(key).map(|v| v.value().clone())
    }

    fn reachable(&self) -> Result<impl Iterator<Item = &Replica> + '_, DhtError> {
        if !self.online.load(Ordering::Relaxed) || self.reach.is_empty() {
            return Err(DhtError::Unreachable);
        }
        Ok(self.reach.iter().filter_map(|i| self.replicas.get(*i)))
    }
}

pub(crate) fn parse_bootstrap(entry: &str) -> Result<(&str, &str), DhtError> {
    match entry.split_once('@') {
        Some((id, addr)) if !id.is_empty() && addr.contains(':') => Ok((id, addr)),
        _ => Err(DhtError::BadBootstrapAddr(entry.to_string())),
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<(), DhtError> {
        if let Err(e) = self.validator.validate(key, &value) {
            tracing::warn!(key, error = %e, "record rejected by validator");
            return Err(e.into());
        }
        for replica in self.reachable()? {
            replica.insert(key.to_string(), value.clone());
        }
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        let candidates: Vec<Vec<u8>> = self
            .reachable()?
            .filter_map(|r| r.get(key).map(|v| v.value().clone()))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        let best = self.validator.select(key, &candidates);
        Ok(candidates.into_iter().nth(best))
    }

    async fn bootstrap(&self, peers: &[String]) -> Result<usize, DhtError> {
        let parsed = peers
            .iter()
            .map(|p| parse_bootstrap(p))
            .collect::<Result<HashMap<_, _>, _>>()?;
        let added = parsed.len();
        for (id, addr) in parsed {
            self.routing.insert(id.to_string(), addr.to_string());
        }
        tracing::info!(peers = added, "bootstrapped routing table");
        Ok(added)
    }

    async fn find_peer(&self, peer_id: &str) -> Result<String, DhtError> {
        self.routing
            .get(peer_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| DhtError::PeerNotFound(peer_id.to_string()))
    }

    async fn list_peers(&self) -> Vec<String> {
        self.routing.iter().map(|e| e.key().clone()).collect()
    }

    async fn add_peer(&self, peer_id: &str, addr: &str) {
        self.routing.insert(peer_id.to_string(), addr.to_string());
    }
}
