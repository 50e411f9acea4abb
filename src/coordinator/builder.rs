// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wiring for [`SyncEngine`].

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{EngineState, SyncEngine};
use crate::actions::{LeadActions, NoopLeadActions};
use crate::config::SyncConfig;
use crate::crm::CrmClient;
use crate::outcome::SyncOutcome;
use crate::resilience::circuit_breaker::{BreakerRegistry, BreakerStore};
use crate::resilience::executor::ResilientExecutor;
use crate::status::StatusModel;
use crate::storage::memory::{MemoryLeadStore, MemoryOutcomeStore};
use crate::storage::sql::SqlStore;
use crate::storage::traits::{LeadStore, OutcomeStore, StorageError};

/// Builder for [`SyncEngine`]. Everything except the CRM client has a default:
/// in-memory stores, no-op side effects, the standard status model and
/// process-local breakers configured from [`SyncConfig`].
pub struct SyncEngineBuilder {
    crm: Arc<dyn CrmClient>,
    config: SyncConfig,
    model: Option<StatusModel>,
    lead_store: Option<Arc<dyn LeadStore>>,
    outcomes: Option<Arc<dyn OutcomeStore>>,
    actions: Option<Arc<dyn LeadActions>>,
    breakers: Option<Arc<dyn BreakerStore>>,
    follow_ups: Option<mpsc::UnboundedSender<SyncOutcome>>,
    cancel: Option<CancellationToken>,
}

impl SyncEngineBuilder {
    pub fn new(crm: Arc<dyn CrmClient>) -> Self {
        Self {
            crm,
            config: SyncConfig::default(),
            model: None,
            lead_store: None,
            outcomes: None,
            actions: None,
            breakers: None,
            follow_ups: None,
            cancel: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn model(mut self, model: StatusModel) -> Self {
        self.model = Some(model);
        self
    }

    #[must_use]
    pub fn lead_store(mut self, store: Arc<dyn LeadStore>) -> Self {
        self.lead_store = Some(store);
        self
    }

    #[must_use]
    pub fn outcome_store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.outcomes = Some(store);
        self
    }

    #[must_use]
    pub fn actions(mut self, actions: Arc<dyn LeadActions>) -> Self {
        self.actions = Some(actions);
        self
    }

    /// Share breaker state with other engines (or another process).
    #[must_use]
    pub fn breakers(mut self, breakers: Arc<dyn BreakerStore>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Receive a copy of every outcome that needs follow-up.
    #[must_use]
    pub fn follow_ups(mut self, tx: mpsc::UnboundedSender<SyncOutcome>) -> Self {
        self.follow_ups = Some(tx);
        self
    }

    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Open `config.outcome_db_url` and use it for both the lead store and
    /// the outcome log. No-op when no URL is configured.
    pub async fn connect_sql(mut self) -> Result<Self, StorageError> {
        let Some(url) = self.config.outcome_db_url.clone() else {
            return Ok(self);
        };
        let store = Arc::new(SqlStore::new(&url).await?);
        info!("Using SQL store for lead statuses and outcomes");
        self.lead_store = Some(store.clone());
        self.outcomes = Some(store);
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> SyncEngine {
        let cancel = self.cancel.unwrap_or_default();
        let breakers = self
            .breakers
            .unwrap_or_else(|| Arc::new(BreakerRegistry::new(self.config.circuit_config())));
        let executor = ResilientExecutor::new(self.config.policy_table(), breakers)
            .with_call_timeout(self.config.call_timeout())
            .with_cancellation(cancel.clone());

        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        SyncEngine {
            model: self.model.unwrap_or_default(),
            crm: self.crm,
            executor,
            lead_store: self.lead_store.unwrap_or_else(|| Arc::new(MemoryLeadStore::new())),
            outcomes: self.outcomes.unwrap_or_else(|| Arc::new(MemoryOutcomeStore::new())),
            actions: self.actions.unwrap_or_else(|| Arc::new(NoopLeadActions)),
            follow_ups: self.follow_ups,
            lead_locks: DashMap::new(),
            state: state_tx,
            state_rx,
            cancel,
            config: self.config,
        }
    }
}
