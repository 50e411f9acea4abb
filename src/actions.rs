// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Side effects triggered by inbound events.
//!
//! Suppression, activity logging and engagement updates are best-effort:
//! each runs independently, a failure is recorded on the outcome and never
//! blocks the status decision or the other effects.

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{EventType, InboundEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    Suppress,
    LogActivity,
    UpdateEngagement,
}

impl SideEffect {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Suppress => "suppress",
            Self::LogActivity => "log_activity",
            Self::UpdateEngagement => "update_engagement",
        }
    }
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened when a side effect ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectRecord {
    pub effect: SideEffect,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{effect} failed: {message}")]
pub struct ActionError {
    pub effect: SideEffect,
    pub message: String,
}

impl ActionError {
    pub fn new(effect: SideEffect, message: impl Into<String>) -> Self {
        Self { effect, message: message.into() }
    }
}

#[async_trait]
pub trait LeadActions: Send + Sync {
    async fn add_to_suppression_list(&self, lead_id: &str, reason: EventType) -> Result<(), ActionError>;

    async fn log_activity(&self, event: &InboundEvent, qualification: Option<&str>) -> Result<(), ActionError>;

    async fn update_engagement(&self, lead_id: &str, event_type: EventType) -> Result<(), ActionError>;
}

/// Discards every side effect.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLeadActions;

#[async_trait]
impl LeadActions for NoopLeadActions {
    async fn add_to_suppression_list(&self, _lead_id: &str, _reason: EventType) -> Result<(), ActionError> {
        Ok(())
    }

    async fn log_activity(&self, _event: &InboundEvent, _qualification: Option<&str>) -> Result<(), ActionError> {
        Ok(())
    }

    async fn update_engagement(&self, _lead_id: &str, _event_type: EventType) -> Result<(), ActionError> {
        Ok(())
    }
}

/// One side effect as seen by [`MemoryLeadActions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAction {
    pub effect: SideEffect,
    pub lead_id: String,
    pub event_type: EventType,
    pub qualification: Option<String>,
}

/// Records side effects in memory; individual effects can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryLeadActions {
    recorded: Mutex<Vec<RecordedAction>>,
    failing: Mutex<Vec<SideEffect>>,
}

impl MemoryLeadActions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, effect: SideEffect) {
        self.failing.lock().push(effect);
    }

    #[must_use]
    pub fn recorded(&self) -> Vec<RecordedAction> {
        self.recorded.lock().clone()
    }

    #[must_use]
    pub fn count(&self, effect: SideEffect) -> usize {
        self.recorded.lock().iter().filter(|a| a.effect == effect).count()
    }

    fn record(
        &self,
        effect: SideEffect,
        lead_id: &str,
        event_type: EventType,
        qualification: Option<&str>,
    ) -> Result<(), ActionError> {
        if self.failing.lock().contains(&effect) {
            return Err(ActionError::new(effect, "injected failure"));
        }
        self.recorded.lock().push(RecordedAction {
            effect,
            lead_id: lead_id.to_string(),
            event_type,
            qualification: qualification.map(str::to_string),
        });
        Ok(())
    }
}

#[async_trait]
impl LeadActions for MemoryLeadActions {
    async fn add_to_suppression_list(&self, lead_id: &str, reason: EventType) -> Result<(), ActionError> {
        self.record(SideEffect::Suppress, lead_id, reason, None)
    }

    async fn log_activity(&self, event: &InboundEvent, qualification: Option<&str>) -> Result<(), ActionError> {
        self.record(SideEffect::LogActivity, &event.lead_id, event.event_type, qualification)
    }

    async fn update_engagement(&self, lead_id: &str, event_type: EventType) -> Result<(), ActionError> {
        self.record(SideEffect::UpdateEngagement, lead_id, event_type, None)
    }
}
