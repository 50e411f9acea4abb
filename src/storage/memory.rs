use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{LeadStore, OutcomeStore, StorageError};
use crate::outcome::SyncOutcome;

pub struct MemoryLeadStore {
    statuses: DashMap<String, i64>,
    fail_writes: AtomicBool,
}

impl MemoryLeadStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            statuses: DashMap::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Seed a lead's status.
    pub fn insert(&self, lead_id: &str, status_id: i64) {
        self.statuses.insert(lead_id.to_string(), status_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Make `set_status` fail (simulates a local disk/database outage).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryLeadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn current_status(&self, lead_id: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.statuses.get(lead_id).map(|r| *r.value()))
    }

    async fn set_status(&self, lead_id: &str, status_id: i64) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("lead store unavailable".into()));
        }
        self.statuses.insert(lead_id.to_string(), status_id);
        Ok(())
    }
}

pub struct MemoryOutcomeStore {
    outcomes: RwLock<Vec<SyncOutcome>>,
    fail_appends: AtomicBool,
}

impl MemoryOutcomeStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            outcomes: RwLock::new(Vec::new()),
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Everything appended so far, in order.
    #[must_use]
    pub fn all(&self) -> Vec<SyncOutcome> {
        self.outcomes.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.read().is_empty()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryOutcomeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutcomeStore for MemoryOutcomeStore {
    async fn append(&self, outcome: &SyncOutcome) -> Result<(), StorageError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("outcome store unavailable".into()));
        }
        let mut outcomes = self.outcomes.write();
        if !outcomes.iter().any(|o| o.id == outcome.id) {
            outcomes.push(outcome.clone());
        }
        Ok(())
    }

    async fn for_lead(&self, lead_id: &str) -> Result<Vec<SyncOutcome>, StorageError> {
        Ok(self
            .outcomes
            .read()
            .iter()
            .filter(|o| o.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn pending_follow_ups(&self, limit: usize) -> Result<Vec<SyncOutcome>, StorageError> {
        let outcomes = self.outcomes.read();
        // Walk newest first so a later success hides earlier failures.
        let mut resolved: HashSet<&str> = HashSet::new();
        let mut pending = Vec::new();
        for outcome in outcomes.iter().rev() {
            if outcome.accepted && outcome.success {
                resolved.insert(outcome.lead_id.as_str());
            } else if outcome.needs_follow_up && !resolved.contains(outcome.lead_id.as_str()) {
                pending.push(outcome.clone());
            }
        }
        pending.reverse();
        pending.truncate(limit);
        Ok(pending)
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.outcomes.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::resilience::classify::{ClassifiedError, ErrorClass};

    fn failed(lead: &str) -> SyncOutcome {
        SyncOutcome::pending(lead, EventType::ReplyReceived, Some(1), Some(3))
            .failed(ClassifiedError::new(ErrorClass::ServerError, "503"), Vec::new())
    }

    fn applied(lead: &str) -> SyncOutcome {
        SyncOutcome::pending(lead, EventType::ReplyReceived, Some(1), Some(3)).applied(3, Vec::new())
    }

    #[tokio::test]
    async fn test_lead_store_roundtrip() {
        let store = MemoryLeadStore::new();
        assert_eq!(store.current_status("a").await.unwrap(), None);
        store.set_status("a", 4).await.unwrap();
        assert_eq!(store.current_status("a").await.unwrap(), Some(4));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_lead_store_write_failure() {
        let store = MemoryLeadStore::new();
        store.fail_writes(true);
        assert!(store.set_status("a", 4).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_append_is_idempotent_by_id() {
        let store = MemoryOutcomeStore::new();
        let outcome = applied("a");
        store.append(&outcome).await.unwrap();
        store.append(&outcome).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_follow_up_resolved_by_later_success() {
        let store = MemoryOutcomeStore::new();
        store.append(&failed("a")).await.unwrap();
        store.append(&failed("b")).await.unwrap();
        store.append(&applied("a")).await.unwrap();
        store.append(&failed("c")).await.unwrap();

        let pending = store.pending_follow_ups(10).await.unwrap();
        let leads: Vec<_> = pending.iter().map(|o| o.lead_id.as_str()).collect();
        assert_eq!(leads, vec!["b", "c"]);

        assert_eq!(store.pending_follow_ups(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_for_lead_keeps_order() {
        let store = MemoryOutcomeStore::new();
        let first = failed("a");
        let second = applied("a");
        store.append(&first).await.unwrap();
        store.append(&applied("b")).await.unwrap();
        store.append(&second).await.unwrap();

        let history = store.for_lead("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first.id);
        assert_eq!(history[1].id, second.id);
    }
}
