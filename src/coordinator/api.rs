// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event handling: the per-event synchronization flow.
//!
//! - `handle()` - decide, apply, run side effects, record the outcome
//! - `reconcile_lead()` - pull the CRM's view of a lead into the local record
//! - `outcomes_for_lead()` / `pending_follow_ups()` - audit log queries

use tracing::{debug, error, info, warn};

use super::decision::{decide, Decision};
use super::{EngineState, HandleOptions, SyncEngine, SyncError};
use crate::actions::{ActionError, SideEffect, SideEffectRecord};
use crate::crm::{GET_LEAD_STATUS, SET_LEAD_STATUS};
use crate::event::{EventPolicy, InboundEvent};
use crate::metrics::{self, LatencyTimer};
use crate::outcome::SyncOutcome;
use crate::resilience::classify::{ClassifiedError, ErrorClass};
use crate::status::StatusKey;
use crate::storage::traits::StorageError;

impl SyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Event handling
    // ═══════════════════════════════════════════════════════════════════════════

    /// Process one inbound event for its lead.
    ///
    /// Policy skips and remote failures are reported in the returned
    /// [`SyncOutcome`]; only local bookkeeping failures are errors. A remote
    /// failure is never dropped: the outcome carries `needs_follow_up` and is
    /// also sent to the follow-up channel when one is configured.
    ///
    /// Calls for the same lead are serialized; the CRM sees them in the order
    /// they acquired the lead's lock.
    #[tracing::instrument(skip(self, event, options), fields(lead_id = %event.lead_id, event = %event.event_type, force = options.force))]
    pub async fn handle(&self, event: &InboundEvent, options: HandleOptions) -> Result<SyncOutcome, SyncError> {
        if !self.is_accepting() {
            return Err(SyncError::ShuttingDown);
        }
        let _timer = LatencyTimer::new(event.event_type.as_str());
        let _lock = self.lock_lead(&event.lead_id).await;

        let current = match self.lead_store.current_status(&event.lead_id).await {
            Ok(current) => current,
            Err(source) => {
                error!(error = %source, "Failed to read local lead status");
                metrics::record_persistence_failure("leads");
                return Err(SyncError::LeadStore { lead_id: event.lead_id.clone(), source });
            }
        };

        let policy = event.policy();
        let candidate = policy.target_status;
        let mut outcome = SyncOutcome::pending(
            event.lead_id.as_str(),
            event.event_type,
            current,
            candidate.map(|key| self.model.id_of(key)),
        );
        outcome.qualification = policy.qualification_label.map(str::to_string);

        outcome = match decide(&self.model, current, candidate, options.force) {
            Decision::Skip(reason) => {
                debug!(reason = reason.as_str(), current = ?current, "Status change skipped");
                metrics::record_skip(reason.as_str());
                outcome.skipped(reason)
            }
            Decision::Unchanged(key) => {
                debug!(status = %key, "Lead already at target status");
                outcome.unchanged()
            }
            Decision::Apply(key) => self.apply_status(outcome, key).await,
        };

        outcome.side_effects = self.run_side_effects(event, &policy).await;

        metrics::record_event(event.event_type.as_str(), outcome.disposition());
        self.persist(outcome).await
    }

    /// Push an accepted status to the CRM and update the local record.
    async fn apply_status(&self, outcome: SyncOutcome, target: StatusKey) -> SyncOutcome {
        let status_id = self.model.id_of(target);
        let lead_id = outcome.lead_id.clone();

        let report = self
            .executor
            .execute_with_retry(SET_LEAD_STATUS, || self.crm.set_lead_status(&lead_id, status_id))
            .await;

        if report.success {
            if let Err(e) = self.lead_store.set_status(&lead_id, status_id).await {
                // The CRM has the change; only our local copy is stale
                error!(
                    status = %target,
                    error = %e,
                    "CRM updated but local lead status write failed"
                );
                metrics::record_persistence_failure("leads");
            }
            info!(
                from = ?outcome.previous_status_id,
                to = %target,
                failed_attempts = report.failed_attempts(),
                "Lead status updated"
            );
            return outcome.applied(status_id, report.attempts);
        }

        let error = report
            .error
            .unwrap_or_else(|| ClassifiedError::new(ErrorClass::Unknown, "cancelled before first attempt"));
        error!(
            status = %target,
            error_class = %error.class,
            error = %error.message,
            attempts = report.attempts.len(),
            cancelled = report.cancelled,
            "Status change not applied; lead needs follow-up"
        );
        metrics::record_follow_up(error.class.as_str());

        let outcome = outcome.failed(error, report.attempts);
        if let Some(tx) = &self.follow_ups {
            if tx.send(outcome.clone()).is_err() {
                warn!("Follow-up receiver dropped; outcome is still in the audit log");
            }
        }
        outcome
    }

    /// Run the event's side effects. Each one is independent; failures are
    /// recorded and never affect the status decision.
    async fn run_side_effects(&self, event: &InboundEvent, policy: &EventPolicy) -> Vec<SideEffectRecord> {
        let mut records = Vec::new();

        if policy.add_to_suppression_list {
            let result = self.actions.add_to_suppression_list(&event.lead_id, event.event_type).await;
            records.push(side_effect_record(SideEffect::Suppress, result));
        }
        if policy.log_activity {
            let result = self.actions.log_activity(event, policy.qualification_label).await;
            records.push(side_effect_record(SideEffect::LogActivity, result));
        }
        if policy.update_engagement_metrics {
            let result = self.actions.update_engagement(&event.lead_id, event.event_type).await;
            records.push(side_effect_record(SideEffect::UpdateEngagement, result));
        }

        records
    }

    async fn persist(&self, outcome: SyncOutcome) -> Result<SyncOutcome, SyncError> {
        match self.outcomes.append(&outcome).await {
            Ok(()) => Ok(outcome),
            Err(source) => {
                // Distinct from remote failures: the CRM may already be updated
                error!(
                    alert = "outcome_persistence",
                    outcome_id = %outcome.id,
                    accepted = outcome.accepted,
                    success = outcome.success,
                    error = %source,
                    "Failed to persist sync outcome"
                );
                metrics::record_persistence_failure("outcomes");
                Err(SyncError::Persistence {
                    lead_id: outcome.lead_id.clone(),
                    outcome: Box::new(outcome),
                    source,
                })
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Reconciliation & audit queries
    // ═══════════════════════════════════════════════════════════════════════════

    /// Read the lead's status from the CRM and overwrite the local record.
    ///
    /// Goes through the executor under its own operation class, so a struggling
    /// read path does not open the breaker for writes. Returns the CRM's
    /// status id, or `None` if the CRM does not know the lead (the local
    /// record is then left alone).
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_lead(&self, lead_id: &str) -> Result<Option<i64>, SyncError> {
        if self.state() == EngineState::Stopped {
            return Err(SyncError::ShuttingDown);
        }
        let _lock = self.lock_lead(lead_id).await;

        let remote = self
            .executor
            .execute_with_retry(GET_LEAD_STATUS, || self.crm.get_lead_status(lead_id))
            .await
            .into_result()?;

        let Some(remote_id) = remote else {
            debug!("Lead unknown to CRM");
            return Ok(None);
        };

        let local = self
            .lead_store
            .current_status(lead_id)
            .await
            .map_err(|source| lead_store_error(lead_id, source))?;

        if local != Some(remote_id) {
            if self.model.by_id(remote_id).is_none() {
                warn!(status_id = remote_id, "CRM reports a status id outside the model");
            }
            self.lead_store
                .set_status(lead_id, remote_id)
                .await
                .map_err(|source| lead_store_error(lead_id, source))?;
            info!(local = ?local, remote = remote_id, "Local lead status reconciled");
        }

        Ok(Some(remote_id))
    }

    /// Audit history for one lead, oldest first.
    pub async fn outcomes_for_lead(&self, lead_id: &str) -> Result<Vec<SyncOutcome>, StorageError> {
        self.outcomes.for_lead(lead_id).await
    }

    /// Failed outcomes not superseded by a later successful write.
    pub async fn pending_follow_ups(&self, limit: usize) -> Result<Vec<SyncOutcome>, StorageError> {
        self.outcomes.pending_follow_ups(limit).await
    }
}

fn side_effect_record(effect: SideEffect, result: Result<(), ActionError>) -> SideEffectRecord {
    match result {
        Ok(()) => {
            metrics::record_side_effect(effect.as_str(), true);
            SideEffectRecord { effect, success: true, error: None }
        }
        Err(e) => {
            warn!(effect = %effect, error = %e, "Side effect failed");
            metrics::record_side_effect(effect.as_str(), false);
            SideEffectRecord { effect, success: false, error: Some(e.message) }
        }
    }
}

fn lead_store_error(lead_id: &str, source: StorageError) -> SyncError {
    metrics::record_persistence_failure("leads");
    SyncError::LeadStore { lead_id: lead_id.to_string(), source }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::actions::MemoryLeadActions;
    use crate::crm::{CrmError, InMemoryCrm};
    use crate::event::EventType;
    use crate::outcome::SkipReason;
    use crate::storage::memory::{MemoryLeadStore, MemoryOutcomeStore};
    use crate::storage::traits::LeadStore;

    struct Harness {
        crm: Arc<InMemoryCrm>,
        leads: Arc<MemoryLeadStore>,
        outcomes: Arc<MemoryOutcomeStore>,
        actions: Arc<MemoryLeadActions>,
        engine: SyncEngine,
    }

    fn harness() -> Harness {
        let crm = Arc::new(InMemoryCrm::new());
        let leads = Arc::new(MemoryLeadStore::new());
        let outcomes = Arc::new(MemoryOutcomeStore::new());
        let actions = Arc::new(MemoryLeadActions::new());
        let engine = SyncEngine::builder(crm.clone())
            .lead_store(leads.clone())
            .outcome_store(outcomes.clone())
            .actions(actions.clone())
            .build();
        Harness { crm, leads, outcomes, actions, engine }
    }

    fn id(key: StatusKey) -> i64 {
        crate::status::StatusModel::standard().id_of(key)
    }

    #[tokio::test]
    async fn test_handle_applies_upgrade() {
        let h = harness();
        h.leads.insert("a", id(StatusKey::InCampaign));

        let outcome = h
            .engine
            .handle(&InboundEvent::new("a", EventType::ReplyReceived), HandleOptions::default())
            .await
            .unwrap();

        assert!(outcome.accepted && outcome.success);
        assert_eq!(outcome.final_status_id, Some(id(StatusKey::ShouldBeContacted)));
        assert_eq!(outcome.qualification.as_deref(), Some("replied"));
        assert_eq!(h.crm.set_calls(), 1);
        assert_eq!(h.leads.current_status("a").await.unwrap(), Some(id(StatusKey::ShouldBeContacted)));
        assert_eq!(h.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_skip_still_runs_side_effects() {
        let h = harness();
        h.leads.insert("a", id(StatusKey::Customer));

        let outcome = h
            .engine
            .handle(&InboundEvent::new("a", EventType::Unsubscribed), HandleOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.skip_reason, Some(SkipReason::Protected));
        assert_eq!(h.crm.set_calls(), 0);
        assert_eq!(h.actions.count(SideEffect::Suppress), 1);
    }

    #[tokio::test]
    async fn test_handle_informational_event() {
        let h = harness();
        let outcome = h
            .engine
            .handle(&InboundEvent::new("a", EventType::EmailOpened), HandleOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.skip_reason, Some(SkipReason::NoTargetStatus));
        assert_eq!(outcome.side_effects.len(), 1);
        assert_eq!(outcome.side_effects[0].effect, SideEffect::UpdateEngagement);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_flagged_and_announced() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let crm = Arc::new(InMemoryCrm::new());
        crm.fail_always(CrmError::Rejected { status: 422, message: "invalid status".into() });
        let engine = SyncEngine::builder(crm.clone()).follow_ups(tx).build();

        let outcome = engine
            .handle(&InboundEvent::new("a", EventType::LeadEnrolled), HandleOptions::default())
            .await
            .unwrap();

        assert!(outcome.accepted);
        assert!(!outcome.success);
        assert!(outcome.needs_follow_up);
        assert_eq!(outcome.final_status_id, None);
        assert_eq!(outcome.error.as_ref().map(|e| e.class), Some(ErrorClass::Permanent));
        assert_eq!(crm.set_calls(), 1);

        let announced = rx.recv().await.unwrap();
        assert_eq!(announced.id, outcome.id);
    }

    #[tokio::test]
    async fn test_outcome_persistence_failure_is_distinct() {
        let h = harness();
        h.outcomes.fail_appends(true);

        let err = h
            .engine
            .handle(&InboundEvent::new("a", EventType::LeadEnrolled), HandleOptions::default())
            .await
            .unwrap_err();

        match err {
            SyncError::Persistence { outcome, .. } => {
                assert!(outcome.success);
                assert_eq!(outcome.final_status_id, Some(id(StatusKey::InCampaign)));
            }
            other => panic!("expected persistence error, got {other:?}"),
        }
        // The remote change happened regardless
        assert_eq!(h.crm.status_of("a"), Some(id(StatusKey::InCampaign)));
    }

    #[tokio::test]
    async fn test_reconcile_overwrites_local_record() {
        let h = harness();
        h.leads.insert("a", id(StatusKey::InCampaign));
        h.crm.seed("a", id(StatusKey::Customer));

        let remote = h.engine.reconcile_lead("a").await.unwrap();
        assert_eq!(remote, Some(id(StatusKey::Customer)));
        assert_eq!(h.leads.current_status("a").await.unwrap(), Some(id(StatusKey::Customer)));
        assert_eq!(h.crm.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_lead_leaves_local_alone() {
        let h = harness();
        h.leads.insert("a", id(StatusKey::InCampaign));

        assert_eq!(h.engine.reconcile_lead("a").await.unwrap(), None);
        assert_eq!(h.leads.current_status("a").await.unwrap(), Some(id(StatusKey::InCampaign)));
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_is_rejected() {
        let h = harness();
        h.engine.shutdown();
        let err = h
            .engine
            .handle(&InboundEvent::new("a", EventType::LeadEnrolled), HandleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));
    }
}
