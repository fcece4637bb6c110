//! Market service: publish and discover holders of a file.
//!
//! `register` is a read-merge-write against the DHT with no lock around the
//! key. Two nodes that read the same stale blob and write back their own
//! merge race, and the reader-side `select` keeps only one of them. The
//! losing holder reappears at its next periodic re-announce.

use std::sync::Arc;

use orca_core::crypto::Identity;
use orca_core::record::{self, HolderEntry, RecordError};
use orca_core::wire::{market_key, TRANSFER_TIMEOUT};
use thiserror::Error;

use crate::chunk_store::FileManifest;
use crate::dht::{Dht, DhtError};
use crate::validator::ValidationError;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("DHT unavailable: {0}")]
    StorageUnavailable(String),

    #[error("stored record is corrupt: {0}")]
    CorruptRecord(#[from] RecordError),

    #[error("record rejected: {0}")]
    Rejected(#[from] ValidationError),
}

impl From<DhtError> for MarketError {
    fn from(e: DhtError) -> Self {
        match e {
            DhtError::Rejected(v) => Self::Rejected(v),
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

/// How this node advertises itself as a holder.
pub struct LocalHolder {
    pub identity: Arc<Identity>,
    pub ip: String,
    pub port: u16,
    pub price: u64,
}

pub struct MarketService {
    dht: Arc<dyn Dht>,
}

impl MarketService {
    pub fn new(dht: Arc<dyn Dht>) -> Self {
        Self { dht }
    }

    /// Advertise `identity` as a holder of `file_hash`.
    pub async fn register(
        &self,
        file_hash: &str,
        price: u64,
        ip: &str,
        port: u16,
        identity: &Identity,
    ) -> Result<(), MarketError> {
        let key = market_key(file_hash);
        let entry = HolderEntry {
            public_key: identity.public_bytes().to_vec(),
            ip: ip.to_string(),
            port,
            price,
        };

        let existing = self.fetch(&key).await?.unwrap_or_default();
        let blob = match record::replace(&existing, entry.clone(), identity) {
            Ok(blob) => blob,
            Err(RecordError::FieldTooLong(n)) => return Err(RecordError::FieldTooLong(n).into()),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "corrupt record treated as empty");
                record::replace(&[], entry, identity)?
            }
        };

        tokio::time::timeout(TRANSFER_TIMEOUT, self.dht.put_value(&key, blob))
            .await
            .map_err(|_| MarketError::StorageUnavailable("put timed out".into()))??;
        tracing::info!(file_hash, price, "registered as holder");
        Ok(())
    }

    /// Register the local node for an imported file.
    pub async fn register_local(
        &self,
        holder: &LocalHolder,
        manifest: &FileManifest,
    ) -> Result<(), MarketError> {
        self.register(
            &manifest.file_hash,
            holder.price,
            &holder.ip,
            holder.port,
            &holder.identity,
        )
        .await
    }

    /// Holders of `file_hash` in record order. Missing or corrupt records are empty.
    ///
    /// Every holder seen is added to the DHT routing table.
    pub async fn lookup(&self, file_hash: &str) -> Result<Vec<HolderEntry>, MarketError> {
        let key = market_key(file_hash);
        let Some(blob) = self.fetch(&key).await? else {
            return Ok(Vec::new());
        };
        let decoded = match record::decode(&blob) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(key = %key, error = %MarketError::CorruptRecord(e), "corrupt record treated as empty");
                return Ok(Vec::new());
            }
        };

        let holders: Vec<HolderEntry> = decoded.entries.into_iter().map(|s| s.entry).collect();
        for h in &holders {
            self.dht
                .add_peer(&h.peer_id(), &format!("{}:{}", h.ip, h.port))
                .await;
        }
        Ok(holders)
    }

    /// Holders sorted by ascending price, ties broken by public key.
    pub async fn lookup_ranked(&self, file_hash: &str) -> Result<Vec<HolderEntry>, MarketError> {
        let mut holders = self.lookup(file_hash).await?;
        holders.sort_by(|a, b| {
            a.price
                .cmp(&b.price)
                .then_with(|| a.public_key.cmp(&b.public_key))
        });
        Ok(holders)
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, MarketError> {
        let value = tokio::time::timeout(TRANSFER_TIMEOUT, self.dht.get_value(key))
            .await
            .map_err(|_| MarketError::StorageUnavailable("get timed out".into()))??;
        Ok(value)
    }
}
