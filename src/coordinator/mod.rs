// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] ties the pieces together for each inbound event:
//! - event mapper picks the candidate status
//! - transition table and priority resolver decide accept or skip
//! - resilient executor pushes accepted changes to the CRM
//! - side effects run best-effort
//! - the outcome is appended to the audit log
//!
//! Events for the same lead are serialized; different leads run in parallel.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lead_sync::{EngineState, EventType, HandleOptions, InboundEvent, InMemoryCrm, SyncEngine};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let crm = Arc::new(InMemoryCrm::new());
//! let engine = SyncEngine::builder(crm).build();
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! let outcome = engine
//!     .handle(&InboundEvent::new("lead-1", EventType::ReplyReceived), HandleOptions::default())
//!     .await
//!     .expect("outcome store is in memory");
//! assert!(outcome.accepted);
//! # }
//! ```

mod api;
mod builder;
pub mod decision;
mod lifecycle;
mod types;

pub use builder::SyncEngineBuilder;
pub use decision::{decide, Decision};
pub use types::{EngineState, HandleOptions, HealthCheck, RunStats, SyncError};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::actions::LeadActions;
use crate::config::SyncConfig;
use crate::crm::{CrmClient, GET_LEAD_STATUS, SET_LEAD_STATUS};
use crate::outcome::SyncOutcome;
use crate::resilience::circuit_breaker::{BreakerSnapshot, CircuitState};
use crate::resilience::executor::ResilientExecutor;
use crate::status::StatusModel;
use crate::storage::traits::{LeadStore, OutcomeStore};

/// Main sync engine coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; share it behind an `Arc`. Per-lead locks
/// live in a concurrent map and are dropped once nobody waits on them.
pub struct SyncEngine {
    pub(super) config: SyncConfig,

    /// Status table and transition graph (immutable)
    pub(super) model: StatusModel,

    pub(super) crm: Arc<dyn CrmClient>,

    /// Retries, backoff and per-class breakers for CRM calls
    pub(super) executor: ResilientExecutor,

    /// Local record of each lead's last applied status
    pub(super) lead_store: Arc<dyn LeadStore>,

    /// Append-only audit log
    pub(super) outcomes: Arc<dyn OutcomeStore>,

    pub(super) actions: Arc<dyn LeadActions>,

    /// Where failed-but-accepted outcomes are announced
    pub(super) follow_ups: Option<mpsc::UnboundedSender<SyncOutcome>>,

    /// One async mutex per lead with work in flight
    pub(super) lead_locks: DashMap<String, Arc<Mutex<()>>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Shared with the executor so shutdown also cuts backoff sleeps short
    pub(super) cancel: CancellationToken,
}

impl SyncEngine {
    /// Start wiring an engine around a CRM client.
    pub fn builder(crm: Arc<dyn CrmClient>) -> SyncEngineBuilder {
        SyncEngineBuilder::new(crm)
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// True until shutdown has been requested.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        matches!(self.state(), EngineState::Created | EngineState::Running)
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn model(&self) -> &StatusModel {
        &self.model
    }

    /// Token that stops `run()` and aborts pending retry backoff.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Breaker state for an operation class, `None` if it never failed.
    pub async fn breaker_snapshot(&self, operation_class: &str) -> Option<BreakerSnapshot> {
        self.executor.breaker_snapshot(operation_class).await
    }

    /// Number of leads currently holding or waiting on a lock.
    #[must_use]
    pub fn active_leads(&self) -> usize {
        self.lead_locks.len()
    }

    /// Collect engine state and probe the outcome store.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();

        let mut open_circuits = Vec::new();
        for class in [SET_LEAD_STATUS, GET_LEAD_STATUS] {
            if let Some(snapshot) = self.breaker_snapshot(class).await {
                if snapshot.state != CircuitState::Closed {
                    open_circuits.push(class.to_string());
                }
            }
        }

        let recorded_outcomes = self.outcomes.count().await.ok();
        let healthy = self.is_accepting() && open_circuits.is_empty() && recorded_outcomes.is_some();

        HealthCheck {
            state,
            open_circuits,
            active_leads: self.active_leads(),
            recorded_outcomes,
            healthy,
        }
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    /// Wait for exclusive access to one lead.
    pub(super) async fn lock_lead(&self, lead_id: &str) -> LeadLock<'_> {
        let mutex = self.lead_locks.entry(lead_id.to_string()).or_default().clone();
        crate::metrics::set_lead_locks(self.lead_locks.len());
        let guard = mutex.clone().lock_owned().await;
        LeadLock {
            engine: self,
            lead_id: lead_id.to_string(),
            mutex,
            guard: Some(guard),
        }
    }
}

/// Held while an event for one lead is processed.
///
/// On drop the lock entry is removed if no other task holds a handle to it.
pub(super) struct LeadLock<'a> {
    engine: &'a SyncEngine,
    lead_id: String,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LeadLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map and `self.mutex` account for two references
        let removed = self
            .engine
            .lead_locks
            .remove_if(&self.lead_id, |_, m| Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) == 2)
            .is_some();
        if removed {
            debug!(lead_id = %self.lead_id, "Released lead lock entry");
        }
        crate::metrics::set_lead_locks(self.engine.lead_locks.len());
    }
}
