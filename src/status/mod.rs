// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lead status model.
//!
//! A lead sits at exactly one [`Status`] at a time. Statuses form a closed,
//! compile-time-known set ([`StatusKey`]); each carries the numeric code the
//! CRM stores, a funnel priority and two flags:
//!
//! - **protected**: human-curated, automated writers may not overwrite it
//!   without `force`
//! - **terminal**: no outgoing transitions
//!
//! | key                   | id | priority | protected | terminal |
//! |-----------------------|----|----------|-----------|----------|
//! | `not_contacted`       | 0  | 10       |           |          |
//! | `in_campaign`         | 1  | 50       |           |          |
//! | `no_reply_in_campaign`| 2  | 60       |           |          |
//! | `should_be_contacted` | 3  | 80       |           |          |
//! | `in_negotiation`      | 4  | 90       | yes       |          |
//! | `customer`            | 5  | 100      | yes       | yes      |
//! | `stop_contacting`     | 6  | 110      |           | yes      |
//!
//! # Example
//!
//! ```
//! use lead_sync::{StatusModel, StatusKey};
//!
//! let model = StatusModel::standard();
//! assert!(model.is_protected(StatusKey::Customer));
//! assert!(model.is_protected(5_i64));
//! assert!(model.is_valid_transition(Some(StatusKey::InCampaign), StatusKey::ShouldBeContacted, false));
//! assert!(!model.is_valid_transition(Some(StatusKey::Customer), StatusKey::InCampaign, false));
//! ```

pub mod priority;
pub mod transitions;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

pub use transitions::TransitionTable;

/// Symbolic name of a lead status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKey {
    NotContacted,
    InCampaign,
    NoReplyInCampaign,
    ShouldBeContacted,
    InNegotiation,
    Customer,
    StopContacting,
}

impl StatusKey {
    /// Every status, in funnel order.
    pub const ALL: [StatusKey; 7] = [
        StatusKey::NotContacted,
        StatusKey::InCampaign,
        StatusKey::NoReplyInCampaign,
        StatusKey::ShouldBeContacted,
        StatusKey::InNegotiation,
        StatusKey::Customer,
        StatusKey::StopContacting,
    ];

    /// Dense index into [`StatusKey::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotContacted => "not_contacted",
            Self::InCampaign => "in_campaign",
            Self::NoReplyInCampaign => "no_reply_in_campaign",
            Self::ShouldBeContacted => "should_be_contacted",
            Self::InNegotiation => "in_negotiation",
            Self::Customer => "customer",
            Self::StopContacting => "stop_contacting",
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownStatus(s.to_string()))
    }
}

/// One row of the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    /// Numeric code stored in the CRM's status field
    pub id: i64,
    pub key: StatusKey,
    pub label: &'static str,
    /// Funnel position; compared, never added
    pub priority: i32,
    pub is_protected: bool,
    pub is_terminal: bool,
}

/// The reference status table.
pub const STANDARD_STATUSES: [Status; 7] = [
    Status { id: 0, key: StatusKey::NotContacted, label: "not contacted", priority: 10, is_protected: false, is_terminal: false },
    Status { id: 1, key: StatusKey::InCampaign, label: "in campaign", priority: 50, is_protected: false, is_terminal: false },
    Status { id: 2, key: StatusKey::NoReplyInCampaign, label: "no reply in campaign", priority: 60, is_protected: false, is_terminal: false },
    Status { id: 3, key: StatusKey::ShouldBeContacted, label: "should be contacted", priority: 80, is_protected: false, is_terminal: false },
    Status { id: 4, key: StatusKey::InNegotiation, label: "in negotiation", priority: 90, is_protected: true, is_terminal: false },
    Status { id: 5, key: StatusKey::Customer, label: "customer", priority: 100, is_protected: true, is_terminal: true },
    Status { id: 6, key: StatusKey::StopContacting, label: "stop contacting", priority: 110, is_protected: false, is_terminal: true },
];

/// A status referenced either by key or by the CRM's numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRef {
    Key(StatusKey),
    Id(i64),
}

impl From<StatusKey> for StatusRef {
    fn from(key: StatusKey) -> Self {
        Self::Key(key)
    }
}

impl From<i64> for StatusRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

/// Immutable status table plus its transition graph.
///
/// Built once at startup and shared behind an `Arc`; nothing mutates it
/// afterwards.
#[derive(Debug, Clone)]
pub struct StatusModel {
    /// Indexed by [`StatusKey::index`]; always holds every key
    statuses: Vec<Status>,
    by_id: HashMap<i64, StatusKey>,
    transitions: TransitionTable,
    stop_contacting: StatusKey,
}

impl StatusModel {
    /// Validate and build a model.
    ///
    /// Fails if a key or id appears twice, if a key is missing, or if a
    /// terminal status has outgoing transitions.
    pub fn new(statuses: &[Status], transitions: TransitionTable) -> Result<Self, ConfigError> {
        let mut slots: Vec<Option<Status>> = vec![None; StatusKey::ALL.len()];
        let mut by_id = HashMap::with_capacity(statuses.len());

        for status in statuses {
            let slot = &mut slots[status.key.index()];
            if slot.is_some() {
                return Err(ConfigError::DuplicateStatusKey(status.key));
            }
            *slot = Some(*status);

            if by_id.insert(status.id, status.key).is_some() {
                return Err(ConfigError::DuplicateStatusId(status.id));
            }
        }

        let mut table = Vec::with_capacity(slots.len());
        for (key, slot) in StatusKey::ALL.into_iter().zip(slots) {
            match slot {
                Some(status) => table.push(status),
                None => return Err(ConfigError::MissingStatus(key)),
            }
        }

        for status in &table {
            if status.is_terminal && transitions.out_degree(status.key) > 0 {
                return Err(ConfigError::TerminalHasTransitions(status.key));
            }
        }

        Ok(Self {
            statuses: table,
            by_id,
            transitions,
            stop_contacting: StatusKey::StopContacting,
        })
    }

    /// The reference table and transition graph.
    #[must_use]
    pub fn standard() -> Self {
        let by_id = STANDARD_STATUSES.iter().map(|s| (s.id, s.key)).collect();
        Self {
            statuses: STANDARD_STATUSES.to_vec(),
            by_id,
            transitions: TransitionTable::standard(),
            stop_contacting: StatusKey::StopContacting,
        }
    }

    /// Look up a status by key. Total: every key is present.
    #[must_use]
    pub fn status(&self, key: StatusKey) -> &Status {
        &self.statuses[key.index()]
    }

    /// Look up a status by the CRM's numeric id.
    #[must_use]
    pub fn by_id(&self, id: i64) -> Option<&Status> {
        self.by_id.get(&id).map(|key| self.status(*key))
    }

    #[must_use]
    pub fn key_for_id(&self, id: i64) -> Option<StatusKey> {
        self.by_id.get(&id).copied()
    }

    #[must_use]
    pub fn id_of(&self, key: StatusKey) -> i64 {
        self.status(key).id
    }

    #[must_use]
    pub fn priority(&self, key: StatusKey) -> i32 {
        self.status(key).priority
    }

    /// The explicit negative-signal status ("stop contacting").
    #[must_use]
    pub fn stop_contacting(&self) -> StatusKey {
        self.stop_contacting
    }

    #[must_use]
    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    /// Statuses reachable from `key` in one automated step.
    pub fn allowed_targets(&self, key: StatusKey) -> impl Iterator<Item = StatusKey> + '_ {
        self.transitions.targets(key)
    }

    /// All statuses, in funnel order.
    pub fn iter(&self) -> impl Iterator<Item = &Status> {
        self.statuses.iter()
    }

    /// True iff the referenced status is protected. Unknown ids are not.
    #[must_use]
    pub fn is_protected(&self, status: impl Into<StatusRef>) -> bool {
        match status.into() {
            StatusRef::Key(key) => self.status(key).is_protected,
            StatusRef::Id(id) => self.by_id(id).is_some_and(|s| s.is_protected),
        }
    }

    #[must_use]
    pub fn is_terminal(&self, key: StatusKey) -> bool {
        self.status(key).is_terminal
    }

    /// See [`TransitionTable::is_valid_transition`].
    #[must_use]
    pub fn is_valid_transition(&self, from: Option<StatusKey>, to: StatusKey, force: bool) -> bool {
        self.transitions.is_valid_transition(from, to, force)
    }

    /// See [`priority::should_upgrade`].
    #[must_use]
    pub fn should_upgrade(&self, current_id: Option<i64>, candidate: StatusKey, force: bool) -> bool {
        priority::should_upgrade(self, current_id, candidate, force)
    }
}

impl Default for StatusModel {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_passes_validation() {
        let model = StatusModel::new(&STANDARD_STATUSES, TransitionTable::standard()).unwrap();
        assert_eq!(model.iter().count(), 7);
    }

    #[test]
    fn test_lookup_by_id_and_key_agree() {
        let model = StatusModel::standard();
        for status in model.iter() {
            assert_eq!(model.by_id(status.id).unwrap().key, status.key);
            assert_eq!(model.id_of(status.key), status.id);
        }
        assert!(model.by_id(42).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut statuses = STANDARD_STATUSES;
        statuses[1].id = 0;
        let err = StatusModel::new(&statuses, TransitionTable::standard()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStatusId(0)));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut statuses = STANDARD_STATUSES;
        statuses[2].key = StatusKey::InCampaign;
        let err = StatusModel::new(&statuses, TransitionTable::standard()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStatusKey(StatusKey::InCampaign)));
    }

    #[test]
    fn test_missing_key_rejected() {
        let err = StatusModel::new(&STANDARD_STATUSES[..6], TransitionTable::standard()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingStatus(StatusKey::StopContacting)));
    }

    #[test]
    fn test_terminal_with_edges_rejected() {
        let table = TransitionTable::standard().allow(StatusKey::Customer, &[StatusKey::InCampaign]);
        let err = StatusModel::new(&STANDARD_STATUSES, table).unwrap_err();
        assert!(matches!(err, ConfigError::TerminalHasTransitions(StatusKey::Customer)));
    }

    #[test]
    fn test_protected_by_key_and_id() {
        let model = StatusModel::standard();
        assert!(model.is_protected(StatusKey::InNegotiation));
        assert!(model.is_protected(StatusKey::Customer));
        assert!(!model.is_protected(StatusKey::InCampaign));
        assert!(model.is_protected(4_i64));
        assert!(!model.is_protected(1_i64));
        assert!(!model.is_protected(999_i64));
    }

    #[test]
    fn test_status_key_parse_roundtrip() {
        for key in StatusKey::ALL {
            assert_eq!(key.as_str().parse::<StatusKey>().unwrap(), key);
        }
        assert!("lost".parse::<StatusKey>().is_err());
    }
}
