//! Public types for the sync engine coordinator.

use serde::Serialize;
use thiserror::Error;

use crate::outcome::SyncOutcome;
use crate::resilience::classify::ClassifiedError;
use crate::storage::traits::StorageError;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, `run()` not called yet. `handle()` already works.
    Created,
    /// Consuming the event stream
    Running,
    /// Cancellation requested; no new events are handled
    ShuttingDown,
    /// Run loop finished
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Per-event switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleOptions {
    /// Bypass protection, transition and priority rules (operator override)
    pub force: bool,
}

impl HandleOptions {
    #[must_use]
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Failures of the engine's own bookkeeping.
///
/// Policy skips and remote failures are *not* errors here: they come back as
/// a [`SyncOutcome`] with `accepted = false` or `needs_follow_up = true`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to read local status of lead '{lead_id}': {source}")]
    LeadStore {
        lead_id: String,
        #[source]
        source: StorageError,
    },

    /// The event was processed but its outcome could not be recorded.
    #[error("outcome for lead '{lead_id}' was not persisted: {source}")]
    Persistence {
        lead_id: String,
        outcome: Box<SyncOutcome>,
        #[source]
        source: StorageError,
    },

    #[error("remote call failed: {0}")]
    Remote(#[from] ClassifiedError),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// The outcome that was computed before the error, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<&SyncOutcome> {
        match self {
            Self::Persistence { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

/// Point-in-time view of the engine for `/health`-style endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    #[serde(serialize_with = "display")]
    pub state: EngineState,
    /// Operation classes whose breaker is not closed
    pub open_circuits: Vec<String>,
    /// Leads with an event in flight
    pub active_leads: usize,
    /// `None` when the probe failed
    pub recorded_outcomes: Option<u64>,
    pub healthy: bool,
}

fn display<S: serde::Serializer>(state: &EngineState, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(state)
}

/// Totals from one [`super::SyncEngine::run()`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub received: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub skipped: u64,
    /// Accepted but not applied remotely
    pub follow_ups: u64,
    /// `handle()` returned an error
    pub errors: u64,
}

impl RunStats {
    pub(super) fn record(&mut self, result: &Result<SyncOutcome, SyncError>) {
        match result {
            Ok(outcome) => match outcome.disposition() {
                "applied" => self.applied += 1,
                "noop" => self.unchanged += 1,
                "skipped" => self.skipped += 1,
                _ => self.follow_ups += 1,
            },
            Err(_) => self.errors += 1,
        }
    }

    pub(super) fn merge(&mut self, other: RunStats) {
        self.received += other.received;
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.follow_ups += other.follow_ups;
        self.errors += other.errors;
    }

    /// Events that reached a final answer (any outcome or error).
    #[must_use]
    pub fn handled(&self) -> u64 {
        self.applied + self.unchanged + self.skipped + self.follow_ups + self.errors
    }
}
