// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Allowed status transitions.
//!
//! A fixed directed graph over [`StatusKey`]. Terminal statuses have no
//! outgoing edges; cycles between non-terminal statuses are fine.

use std::collections::{BTreeSet, HashMap};

use super::StatusKey;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionTable {
    edges: HashMap<StatusKey, BTreeSet<StatusKey>>,
}

impl TransitionTable {
    /// An empty table (every status terminal).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `from → target` edges for every target.
    #[must_use]
    pub fn allow(mut self, from: StatusKey, targets: &[StatusKey]) -> Self {
        self.edges.entry(from).or_default().extend(targets.iter().copied());
        self
    }

    /// The reference graph.
    #[must_use]
    pub fn standard() -> Self {
        use StatusKey::*;

        Self::new()
            .allow(
                NotContacted,
                &[InCampaign, NoReplyInCampaign, ShouldBeContacted, InNegotiation, Customer, StopContacting],
            )
            .allow(
                InCampaign,
                &[NoReplyInCampaign, ShouldBeContacted, InNegotiation, Customer, StopContacting],
            )
            .allow(
                NoReplyInCampaign,
                &[InCampaign, ShouldBeContacted, InNegotiation, Customer, StopContacting],
            )
            .allow(ShouldBeContacted, &[InCampaign, InNegotiation, Customer, StopContacting])
            .allow(InNegotiation, &[ShouldBeContacted, Customer, StopContacting])
    }

    /// Targets reachable from `from` in one step. Unknown `from` yields nothing.
    pub fn targets(&self, from: StatusKey) -> impl Iterator<Item = StatusKey> + '_ {
        self.edges.get(&from).into_iter().flatten().copied()
    }

    #[must_use]
    pub fn out_degree(&self, from: StatusKey) -> usize {
        self.edges.get(&from).map_or(0, BTreeSet::len)
    }

    #[must_use]
    pub fn contains(&self, from: StatusKey, to: StatusKey) -> bool {
        self.edges.get(&from).is_some_and(|targets| targets.contains(&to))
    }

    /// Decide whether `from → to` is legal.
    ///
    /// - `force` always wins
    /// - a lead with no status may move anywhere
    /// - otherwise `to` must be an edge out of `from`
    #[must_use]
    pub fn is_valid_transition(&self, from: Option<StatusKey>, to: StatusKey, force: bool) -> bool {
        if force {
            return true;
        }
        match from {
            None => true,
            Some(from) => self.contains(from, to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StatusKey::*;

    #[test]
    fn test_force_always_valid() {
        let table = TransitionTable::standard();
        for from in StatusKey::ALL {
            for to in StatusKey::ALL {
                assert!(table.is_valid_transition(Some(from), to, true));
            }
        }
    }

    #[test]
    fn test_no_current_status_allows_anything() {
        let table = TransitionTable::standard();
        for to in StatusKey::ALL {
            assert!(table.is_valid_transition(None, to, false));
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_targets() {
        let table = TransitionTable::standard();
        assert_eq!(table.out_degree(Customer), 0);
        assert_eq!(table.out_degree(StopContacting), 0);
        assert_eq!(table.targets(Customer).count(), 0);
        assert!(!table.is_valid_transition(Some(Customer), InCampaign, false));
    }

    #[test]
    fn test_cycles_between_non_terminal_allowed() {
        let table = TransitionTable::standard();
        assert!(table.is_valid_transition(Some(InCampaign), NoReplyInCampaign, false));
        assert!(table.is_valid_transition(Some(NoReplyInCampaign), InCampaign, false));
    }

    #[test]
    fn test_reply_from_campaign_is_allowed() {
        let table = TransitionTable::standard();
        assert!(table.is_valid_transition(Some(InCampaign), ShouldBeContacted, false));
    }

    #[test]
    fn test_unknown_source_treated_as_empty() {
        let table = TransitionTable::new();
        assert!(!table.is_valid_transition(Some(InCampaign), ShouldBeContacted, false));
        assert_eq!(table.targets(InCampaign).count(), 0);
    }

    #[test]
    fn test_allow_merges_targets() {
        let table = TransitionTable::new()
            .allow(InCampaign, &[Customer])
            .allow(InCampaign, &[StopContacting, Customer]);
        assert_eq!(table.out_degree(InCampaign), 2);
        assert_eq!(table.targets(InCampaign).collect::<Vec<_>>(), vec![Customer, StopContacting]);
    }
}
