// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The audit record written for every handled event.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actions::SideEffectRecord;
use crate::event::EventType;
use crate::resilience::classify::ClassifiedError;
use crate::resilience::executor::AttemptRecord;

/// Why a candidate status was not applied. A normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotAllowed,
    LowerPriority,
    Protected,
    NoTargetStatus,
}

impl SkipReason {
    pub const ALL: [SkipReason; 4] = [
        SkipReason::NotAllowed,
        SkipReason::LowerPriority,
        SkipReason::Protected,
        SkipReason::NoTargetStatus,
    ];

    /// Stable machine name (metrics labels, database column).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAllowed => "not_allowed",
            Self::LowerPriority => "lower_priority",
            Self::Protected => "protected",
            Self::NoTargetStatus => "no_target_status",
        }
    }

    /// Operator-facing description.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotAllowed => "target not in allowed transition set",
            Self::LowerPriority => "current status has lower upgrade priority deficit",
            Self::Protected => "current status is protected",
            Self::NoTargetStatus => "event does not map to a status",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// One handled event. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub id: String,
    pub lead_id: String,
    pub event_type: EventType,
    pub previous_status_id: Option<i64>,
    pub candidate_status_id: Option<i64>,
    pub final_status_id: Option<i64>,
    pub accepted: bool,
    pub skip_reason: Option<SkipReason>,
    pub qualification: Option<String>,
    pub retry_attempts: Vec<AttemptRecord>,
    pub success: bool,
    /// Accepted but not applied; someone has to look at this lead
    pub needs_follow_up: bool,
    pub error: Option<ClassifiedError>,
    pub side_effects: Vec<SideEffectRecord>,
    /// Epoch millis
    pub recorded_at: i64,
}

impl SyncOutcome {
    /// A fresh outcome with nothing decided yet. The final status starts at
    /// the previous one.
    pub fn pending(
        lead_id: impl Into<String>,
        event_type: EventType,
        previous_status_id: Option<i64>,
        candidate_status_id: Option<i64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            lead_id: lead_id.into(),
            event_type,
            previous_status_id,
            candidate_status_id,
            final_status_id: previous_status_id,
            accepted: false,
            skip_reason: None,
            qualification: None,
            retry_attempts: Vec::new(),
            success: false,
            needs_follow_up: false,
            error: None,
            side_effects: Vec::new(),
            recorded_at: now_millis(),
        }
    }

    /// Not applied for a policy reason. Succeeds: skipping is correct behavior.
    #[must_use]
    pub fn skipped(mut self, reason: SkipReason) -> Self {
        self.accepted = false;
        self.skip_reason = Some(reason);
        self.success = true;
        self
    }

    /// Accepted, and the remote already agrees (replay).
    #[must_use]
    pub fn unchanged(mut self) -> Self {
        self.accepted = true;
        self.success = true;
        self
    }

    #[must_use]
    pub fn applied(mut self, final_status_id: i64, attempts: Vec<AttemptRecord>) -> Self {
        self.accepted = true;
        self.success = true;
        self.final_status_id = Some(final_status_id);
        self.retry_attempts = attempts;
        self
    }

    /// Accepted, but the remote mutation never landed.
    #[must_use]
    pub fn failed(mut self, error: ClassifiedError, attempts: Vec<AttemptRecord>) -> Self {
        self.accepted = true;
        self.success = false;
        self.needs_follow_up = true;
        self.error = Some(error);
        self.retry_attempts = attempts;
        self
    }

    #[must_use]
    pub fn status_changed(&self) -> bool {
        self.final_status_id != self.previous_status_id
    }

    #[must_use]
    pub fn failed_side_effects(&self) -> usize {
        self.side_effects.iter().filter(|s| !s.success).count()
    }

    /// Metrics label for what happened.
    #[must_use]
    pub fn disposition(&self) -> &'static str {
        match (self.accepted, self.success) {
            (false, _) => "skipped",
            (true, false) => "failed",
            (true, true) if self.status_changed() => "applied",
            (true, true) => "noop",
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
