// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory CRM with scriptable faults.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{CrmClient, CrmError};

/// A CRM that lives in a map.
///
/// Failures are consumed in this order: per-lead permanent faults, then the
/// one-shot queue (`fail_next`), then the global fault (`fail_always`).
#[derive(Default)]
pub struct InMemoryCrm {
    statuses: DashMap<String, i64>,
    history: DashMap<String, Vec<i64>>,
    next_failures: Mutex<VecDeque<CrmError>>,
    always: Mutex<Option<CrmError>>,
    lead_failures: DashMap<String, CrmError>,
    latency: Mutex<Option<Duration>>,
    set_calls: AtomicU64,
    get_calls: AtomicU64,
}

impl InMemoryCrm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a lead's status without counting a call.
    pub fn seed(&self, lead_id: &str, status_id: i64) {
        self.statuses.insert(lead_id.to_string(), status_id);
    }

    #[must_use]
    pub fn status_of(&self, lead_id: &str) -> Option<i64> {
        self.statuses.get(lead_id).map(|s| *s)
    }

    /// Every status successfully written for a lead, in order.
    #[must_use]
    pub fn history(&self, lead_id: &str) -> Vec<i64> {
        self.history.get(lead_id).map(|h| h.clone()).unwrap_or_default()
    }

    /// Fail the next call (of either kind) with `err`. Queues.
    pub fn fail_next(&self, err: CrmError) {
        self.next_failures.lock().push_back(err);
    }

    /// Fail every call until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, err: CrmError) {
        *self.always.lock() = Some(err);
    }

    /// Fail every call for one lead.
    pub fn fail_lead(&self, lead_id: &str, err: CrmError) {
        self.lead_failures.insert(lead_id.to_string(), err);
    }

    pub fn clear_failures(&self) {
        self.next_failures.lock().clear();
        *self.always.lock() = None;
        self.lead_failures.clear();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    #[must_use]
    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    async fn simulate(&self, lead_id: &str) -> Result<(), CrmError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.lead_failures.get(lead_id) {
            return Err(err.clone());
        }
        if let Some(err) = self.next_failures.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.always.lock().clone() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl CrmClient for InMemoryCrm {
    async fn set_lead_status(&self, lead_id: &str, status_id: i64) -> Result<(), CrmError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate(lead_id).await?;
        self.statuses.insert(lead_id.to_string(), status_id);
        self.history.entry(lead_id.to_string()).or_default().push(status_id);
        Ok(())
    }

    async fn get_lead_status(&self, lead_id: &str) -> Result<Option<i64>, CrmError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate(lead_id).await?;
        Ok(self.status_of(lead_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let crm = InMemoryCrm::new();
        assert_eq!(crm.get_lead_status("a").await.unwrap(), None);
        crm.set_lead_status("a", 3).await.unwrap();
        assert_eq!(crm.get_lead_status("a").await.unwrap(), Some(3));
        assert_eq!(crm.set_calls(), 1);
        assert_eq!(crm.get_calls(), 2);
        assert_eq!(crm.history("a"), vec![3]);
    }

    #[tokio::test]
    async fn test_fail_next_is_consumed_in_order() {
        let crm = InMemoryCrm::new();
        crm.fail_next(CrmError::Timeout);
        crm.fail_next(CrmError::Network("reset".into()));

        assert_eq!(crm.set_lead_status("a", 1).await, Err(CrmError::Timeout));
        assert_eq!(crm.set_lead_status("a", 1).await, Err(CrmError::Network("reset".into())));
        assert!(crm.set_lead_status("a", 1).await.is_ok());
        assert_eq!(crm.set_calls(), 3);
        assert_eq!(crm.history("a"), vec![1]);
    }

    #[tokio::test]
    async fn test_failures_do_not_write() {
        let crm = InMemoryCrm::new();
        crm.seed("a", 1);
        crm.fail_always(CrmError::Server { status: 503, message: "down".into() });
        assert!(crm.set_lead_status("a", 3).await.is_err());
        assert_eq!(crm.status_of("a"), Some(1));

        crm.clear_failures();
        crm.set_lead_status("a", 3).await.unwrap();
        assert_eq!(crm.status_of("a"), Some(3));
    }

    #[tokio::test]
    async fn test_lead_fault_is_scoped() {
        let crm = InMemoryCrm::new();
        crm.fail_lead("bad", CrmError::Timeout);
        assert!(crm.set_lead_status("bad", 1).await.is_err());
        assert!(crm.set_lead_status("good", 1).await.is_ok());
    }
}
