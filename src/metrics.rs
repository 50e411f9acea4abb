// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for lead-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `lead_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `event`: inbound event type (`reply_received`, `bounced`, ...)
//! - `class`: remote operation class (`crm.set_lead_status`, ...)
//! - `outcome`: applied, noop, skipped, failed
//! - `error_class`: classification of a failed attempt

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// EVENTS - Per-event decisions
// ═══════════════════════════════════════════════════════════════════════════

/// Record a handled event and what happened to it
pub fn record_event(event: &str, outcome: &str) {
    counter!(
        "lead_sync_events_total",
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a policy skip
pub fn record_skip(reason: &str) {
    counter!(
        "lead_sync_skips_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record end-to-end handle latency
pub fn record_handle_latency(event: &str, duration: Duration) {
    histogram!(
        "lead_sync_handle_seconds",
        "event" => event.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE CALLS - Attempts, retries, breakers
// ═══════════════════════════════════════════════════════════════════════════

/// Record one remote attempt (`result` is "success" or an error class)
pub fn record_remote_attempt(class: &str, result: &str) {
    counter!(
        "lead_sync_remote_attempts_total",
        "class" => class.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record a scheduled retry
pub fn record_retry(class: &str, error_class: &str) {
    counter!(
        "lead_sync_retries_total",
        "class" => class.to_string(),
        "error_class" => error_class.to_string()
    )
    .increment(1);
}

/// Record circuit breaker state change (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "lead_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "lead_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a breaker opening
pub fn record_circuit_trip(circuit: &str) {
    counter!(
        "lead_sync_circuit_breaker_trips_total",
        "circuit" => circuit.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// FAILURES - Things an operator must look at
// ═══════════════════════════════════════════════════════════════════════════

/// Record an accepted status change that could not be applied remotely
pub fn record_follow_up(error_class: &str) {
    counter!(
        "lead_sync_follow_ups_total",
        "error_class" => error_class.to_string()
    )
    .increment(1);
}

/// Record a failure to write local state (`store` is "outcomes" or "leads")
pub fn record_persistence_failure(store: &str) {
    counter!(
        "lead_sync_persistence_failures_total",
        "store" => store.to_string()
    )
    .increment(1);
}

/// Record a side effect attempt
pub fn record_side_effect(effect: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "lead_sync_side_effects_total",
        "effect" => effect.to_string(),
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE - Lifecycle and queues
// ═══════════════════════════════════════════════════════════════════════════

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "lead_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set number of leads with a live queue in the run loop
pub fn set_active_lead_queues(count: usize) {
    gauge!("lead_sync_active_lead_queues").set(count as f64);
}

/// Set number of leads holding a lock in `handle`
pub fn set_lead_locks(count: usize) {
    gauge!("lead_sync_lead_locks").set(count as f64);
}

/// A timing guard that records handle latency on drop
pub struct LatencyTimer {
    event: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_handle_latency(self.event, self.start.elapsed());
    }
}
