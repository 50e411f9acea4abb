//! # Lead Sync
//!
//! Keeps a CRM's lead statuses in step with events from an outbound campaign
//! tool, without letting automation undo what sales already decided.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Inbound Event                         │
//! │  • lead_id + EventType (at-least-once delivery)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Event Mapper                          │
//! │  • candidate status, qualification label, side effects      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Transition Validator + Priority Resolver           │
//! │  • protected statuses, allowed edges, funnel priority       │
//! │  • accept, or skip with a SkipReason                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ (accepted)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Resilient Executor                       │
//! │  • error classification and per-class backoff               │
//! │  • circuit breaker per operation class                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Outcome Store                          │
//! │  • append-only audit log, follow-up queue                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lead_sync::{EventType, HandleOptions, HttpCrmClient, InboundEvent, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         crm_base_url: Some("https://crm.example.com/api/v1".into()),
//!         crm_api_token: Some("secret".into()),
//!         outcome_db_url: Some("sqlite:outcomes.db".into()),
//!         ..Default::default()
//!     };
//!
//!     let crm = Arc::new(HttpCrmClient::from_config(&config).expect("CRM config"));
//!     let engine = SyncEngine::builder(crm)
//!         .config(config)
//!         .connect_sql()
//!         .await
//!         .expect("Failed to open outcome database")
//!         .build();
//!
//!     let event = InboundEvent::new("crm-42", EventType::ReplyReceived);
//!     let outcome = engine.handle(&event, HandleOptions::default()).await.expect("persisted");
//!     println!("{} -> {:?}", outcome.lead_id, outcome.final_status_id);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`status`]: status table, transition graph, priority resolver
//! - [`event`]: event types and what each one means
//! - [`resilience`]: classification, backoff, circuit breakers, executor
//! - [`coordinator`]: the [`SyncEngine`] orchestrating all of the above
//! - [`crm`]: the remote CRM interface (HTTP and in-memory)
//! - [`storage`]: lead status record and outcome audit log (memory, SQL)
//! - [`actions`]: side effects such as suppression and activity logging

pub mod actions;
pub mod config;
pub mod coordinator;
pub mod crm;
pub mod event;
pub mod metrics;
pub mod outcome;
pub mod resilience;
pub mod status;
pub mod storage;

pub use actions::{LeadActions, MemoryLeadActions, NoopLeadActions, SideEffect, SideEffectRecord};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{EngineState, HandleOptions, HealthCheck, RunStats, SyncEngine, SyncEngineBuilder, SyncError};
pub use crm::{CrmClient, CrmError, HttpCrmClient, InMemoryCrm};
pub use event::{EventPolicy, EventType, InboundEvent};
pub use outcome::{SkipReason, SyncOutcome};
pub use resilience::circuit_breaker::{BreakerRegistry, BreakerSnapshot, BreakerStore, CircuitConfig, CircuitState};
pub use resilience::classify::{ClassPolicy, ClassifiedError, Classify, ErrorClass, PolicyTable};
pub use resilience::executor::{AttemptRecord, ExecutionReport, ResilientExecutor};
pub use resilience::retry::{BackoffStrategy, RetryConfig};
pub use status::{Status, StatusKey, StatusModel};
pub use storage::traits::{LeadStore, OutcomeStore, StorageError};
pub use metrics::LatencyTimer;
