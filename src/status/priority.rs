// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority-based conflict resolution.
//!
//! Automated writers may move a lead forward in the funnel but not back,
//! except for the explicit negative signal (bounce, unsubscribe, rejection),
//! which always gets through.

use super::{StatusKey, StatusModel};

/// Should `candidate` overwrite the lead's current status?
///
/// Ties go to the candidate (`>=`), so replaying an event of the same class
/// re-applies instead of being dropped. An unknown current id has no priority
/// to defend and is always upgraded.
#[must_use]
pub fn should_upgrade(
    model: &StatusModel,
    current_id: Option<i64>,
    candidate: StatusKey,
    force: bool,
) -> bool {
    if force {
        return true;
    }

    let Some(current_id) = current_id else {
        return true;
    };

    if candidate == model.stop_contacting() {
        return true;
    }

    match model.by_id(current_id) {
        Some(current) => model.priority(candidate) >= current.priority,
        None => true,
    }
}
