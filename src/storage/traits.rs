use async_trait::async_trait;
use thiserror::Error;

use crate::outcome::SyncOutcome;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt record '{id}': {reason}")]
    Corrupt { id: String, reason: String },
}

/// Local record of each lead's last applied status.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn current_status(&self, lead_id: &str) -> Result<Option<i64>, StorageError>;
    async fn set_status(&self, lead_id: &str, status_id: i64) -> Result<(), StorageError>;
}

/// Append-only audit log of sync outcomes.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Append an outcome. Appending the same outcome id twice is a no-op.
    async fn append(&self, outcome: &SyncOutcome) -> Result<(), StorageError>;

    /// All outcomes for a lead, oldest first.
    async fn for_lead(&self, lead_id: &str) -> Result<Vec<SyncOutcome>, StorageError>;

    /// Failed outcomes not yet superseded by a later successful write for
    /// the same lead, oldest first.
    async fn pending_follow_ups(&self, limit: usize) -> Result<Vec<SyncOutcome>, StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;
}
