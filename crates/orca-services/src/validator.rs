//! Market record validator: the DHT's write gate and conflict resolver.
//!
//! Invoked by the DHT capability, never by callers directly. A write is
//! accepted whole or rejected whole.

use std::collections::HashSet;
use std::sync::Arc;

use orca_core::record::{self, RecordError};
use orca_core::wire::MARKET_PREFIX;
use thiserror::Error;

use crate::dht::RecordValidator;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("key {0:?} is not market/<sha256 hex>")]
    InvalidKeyFormat(String),

    #[error("public key {0} appears more than once")]
    DuplicateHolderRecord(String),

    #[error("signature check failed for holder {0}")]
    InvalidSignature(String),

    #[error("record timestamp {stamp} is ahead of local clock {now}")]
    FutureTimestamp { stamp: u64, now: u64 },

    #[error("record does not decode: {0}")]
    Malformed(#[from] RecordError),
}

/// Wall clock in Unix seconds. Injected so tests can pin "now".
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Validator for `market/<fileHash>` records.
#[derive(Clone)]
pub struct MarketValidator {
    clock: Clock,
}

impl Default for MarketValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketValidator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(record::unix_now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self { clock }
    }
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl RecordValidator for MarketValidator {
    fn validate(&self, key: &str, value: &[u8]) -> Result<(), ValidationError> {
        match key.strip_prefix(MARKET_PREFIX) {
            Some(hash) if is_sha256_hex(hash) => {}
            _ => return Err(ValidationError::InvalidKeyFormat(key.to_string())),
        }

        let decoded = record::decode(value)?;

        let mut seen = HashSet::with_capacity(decoded.entries.len());
        for signed in &decoded.entries {
            if !seen.insert(signed.entry.public_key.as_slice()) {
                return Err(ValidationError::DuplicateHolderRecord(signed.entry.peer_id()));
            }
        }

        if let Some(bad) = decoded.entries.iter().find(|s| !s.verify()) {
            return Err(ValidationError::InvalidSignature(bad.entry.peer_id()));
        }

        let now = (self.clock)();
        if decoded.timestamp > now {
            return Err(ValidationError::FutureTimestamp {
                stamp: decoded.timestamp,
                now,
            });
        }
        Ok(())
    }

    /// Longest blob wins; on equal length the later timestamp wins.
    ///
    /// Length-first can prefer a blob padded with stale holders over a
    /// shorter, fresher one. Empty `candidates` returns 0.
    fn select(&self, _key: &str, candidates: &[Vec<u8>]) -> usize {
        let mut best = 0;
        let mut best_rank = (0usize, 0u64);
        for (i, blob) in candidates.iter().enumerate() {
            let rank = (blob.len(), record::timestamp_of(blob).unwrap_or(0));
            if i == 0 || rank > best_rank {
                best = i;
                best_rank = rank;
            }
        }
        best
    }
}
