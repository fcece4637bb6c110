//! Payment capability, invoked once per received chunk.
//!
//! Settlement is outside this node. [`LedgerPayments`] records each payment
//! as one JSON line so the wallet side can pick them up.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment not authorized")]
    Unauthorized,

    #[error("payment rejected: {0}")]
    Rejected(String),

    #[error("ledger write failed: {0}")]
    Ledger(#[from] std::io::Error),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Pay `amount` to `recipient` (the holder's hex public key).
    async fn pay(&self, amount: u64, recipient: &str, auth_token: &str) -> Result<(), PaymentError>;
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub time: DateTime<Utc>,
    pub amount: u64,
    pub recipient: String,
}

/// Append-only JSON-lines payment ledger.
pub struct LedgerPayments {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LedgerPayments {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Every recorded payment, oldest first. A missing ledger is empty.
    pub async fn entries(&self) -> anyhow::Result<Vec<LedgerEntry>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(anyhow::Error::from))
            .collect()
    }
}

#[async_trait]
impl PaymentGateway for LedgerPayments {
    async fn pay(&self, amount: u64, recipient: &str, auth_token: &str) -> Result<(), PaymentError> {
        if auth_token.is_empty() {
            return Err(PaymentError::Unauthorized);
        }
        if recipient.is_empty() {
            return Err(PaymentError::Rejected("empty recipient".into()));
        }

        let entry = LedgerEntry {
            time: Utc::now(),
            amount,
            recipient: recipient.to_string(),
        };
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| PaymentError::Rejected(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        tracing::debug!(amount, recipient, "payment recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_ledger() -> LedgerPayments {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("orca-ledger-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        LedgerPayments::new(dir.join("transactions.jsonl"))
    }

    #[tokio::test]
    async fn payments_append_in_order() {
        let ledger = temp_ledger();
        ledger.pay(3, "aa", "token").await.unwrap();
        ledger.pay(5, "bb", "token").await.unwrap();

        let entries = ledger.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, 3);
        assert_eq!(entries[1].recipient, "bb");
    }

    #[tokio::test]
    async fn empty_token_is_unauthorized() {
        let ledger = temp_ledger();
        assert!(matches!(
            ledger.pay(1, "aa", "").await,
            Err(PaymentError::Unauthorized)
        ));
        assert!(ledger.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_recipient_is_rejected() {
        let ledger = temp_ledger();
        assert!(matches!(
            ledger.pay(1, "", "token").await,
            Err(PaymentError::Rejected(_))
        ));
    }
}
