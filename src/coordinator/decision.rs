// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pure accept/skip decision for one candidate status.

use crate::outcome::SkipReason;
use crate::status::{StatusKey, StatusModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Push the candidate to the CRM
    Apply(StatusKey),
    /// The lead is already there; nothing to send
    Unchanged(StatusKey),
    Skip(SkipReason),
}

/// Decide whether `candidate` may replace the lead's current status.
///
/// Guards run in this order, first match wins:
///
/// 1. no candidate → `NoTargetStatus`
/// 2. protected current status (unless forced) → `Protected`
/// 3. current id equals candidate id → `Unchanged`
/// 4. edge not in the transition graph → `NotAllowed`
/// 5. candidate loses on priority → `LowerPriority`
///
/// A current id the model does not know has no outgoing edges, so only a
/// forced event can move such a lead.
#[must_use]
pub fn decide(
    model: &StatusModel,
    current_id: Option<i64>,
    candidate: Option<StatusKey>,
    force: bool,
) -> Decision {
    let Some(candidate) = candidate else {
        return Decision::Skip(SkipReason::NoTargetStatus);
    };

    if let Some(id) = current_id {
        if !force && model.is_protected(id) {
            return Decision::Skip(SkipReason::Protected);
        }
        if id == model.id_of(candidate) {
            return Decision::Unchanged(candidate);
        }
    }

    let valid = match current_id {
        None => model.is_valid_transition(None, candidate, force),
        Some(id) => match model.key_for_id(id) {
            Some(current) => model.is_valid_transition(Some(current), candidate, force),
            None => force,
        },
    };
    if !valid {
        return Decision::Skip(SkipReason::NotAllowed);
    }

    if !model.should_upgrade(current_id, candidate, force) {
        return Decision::Skip(SkipReason::LowerPriority);
    }

    Decision::Apply(candidate)
}
