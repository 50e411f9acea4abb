// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-operation-class circuit breakers.
//!
//! Protects the CRM from being hammered during sustained outages. One breaker
//! exists per operation class (e.g. `crm.set_lead_status`), shared by every
//! lead, created lazily on that class's first failure.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Remote unhealthy, requests fail fast without being sent
//! - HalfOpen: Cool-down elapsed, exactly one trial request allowed
//!
//! ```text
//!            threshold consecutive failures
//!   Closed ─────────────────────────────────▶ Open
//!     ▲                                        │ cool-down elapsed
//!     │ trial succeeds                         ▼
//!     └──────────────────────────────────── HalfOpen ──▶ Open (trial fails)
//! ```
//!
//! State lives in memory and resets on restart. [`BreakerStore`] is the seam
//! for a shared implementation when several processes call the same CRM.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// How long to reject calls before allowing a trial (half-open)
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Whether a call may go ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open probe
    Trial,
    Rejected { retry_in: Duration },
}

impl Admission {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// What a recorded failure did to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEffect {
    /// Counted, still below threshold (or already open)
    Counted,
    /// This failure crossed the threshold and opened the breaker
    Tripped,
    /// The half-open trial failed; open again with a fresh deadline
    Reopened,
    /// Failure class does not count; the remote answered, so it is reachable
    Ignored,
}

/// Point-in-time view of one class's breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub next_retry_allowed_after: Option<Instant>,
    /// Times this breaker has opened since creation
    pub trips: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    next_retry_allowed_after: Option<Instant>,
    trial_started_at: Option<Instant>,
    trips: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            next_retry_allowed_after: None,
            trial_started_at: None,
            trips: 0,
        }
    }

    fn admit(&mut self, config: &CircuitConfig, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let until = self.next_retry_allowed_after.unwrap_or(now);
                if now >= until {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started_at = Some(now);
                    Admission::Trial
                } else {
                    Admission::Rejected { retry_in: until - now }
                }
            }
            CircuitState::HalfOpen => {
                // A trial whose caller vanished frees the slot after another cool-down.
                match self.trial_started_at {
                    Some(started) if now.duration_since(started) < config.recovery_timeout => {
                        Admission::Rejected {
                            retry_in: config.recovery_timeout - now.duration_since(started),
                        }
                    }
                    _ => {
                        self.trial_started_at = Some(now);
                        Admission::Trial
                    }
                }
            }
        }
    }

    /// Returns the previous state if this closed the breaker.
    fn on_success(&mut self) -> Option<CircuitState> {
        let previous = self.state;
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.next_retry_allowed_after = None;
        self.trial_started_at = None;
        (previous != CircuitState::Closed).then_some(previous)
    }

    fn on_failure(&mut self, config: &CircuitConfig, trips_breaker: bool, now: Instant) -> FailureEffect {
        if !trips_breaker {
            match self.state {
                CircuitState::Closed | CircuitState::HalfOpen => {
                    self.on_success();
                }
                CircuitState::Open => {}
            }
            return FailureEffect::Ignored;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);

        match self.state {
            CircuitState::Closed if self.consecutive_failures >= config.failure_threshold => {
                self.open(config, now);
                FailureEffect::Tripped
            }
            CircuitState::HalfOpen => {
                self.open(config, now);
                FailureEffect::Reopened
            }
            // Late failures from calls admitted before the trip keep the deadline.
            CircuitState::Closed | CircuitState::Open => FailureEffect::Counted,
        }
    }

    fn open(&mut self, config: &CircuitConfig, now: Instant) {
        self.state = CircuitState::Open;
        self.next_retry_allowed_after = Some(now + config.recovery_timeout);
        self.trial_started_at = None;
        self.trips += 1;
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            next_retry_allowed_after: self.next_retry_allowed_after,
            trips: self.trips,
        }
    }
}

/// Shared breaker state, keyed by operation class.
///
/// Implementations must serialize mutation per class: two concurrent failures
/// for the same class may not both observe the threshold crossing.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn admit(&self, class: &str) -> Admission;
    async fn record_success(&self, class: &str);
    async fn record_failure(&self, class: &str, trips_breaker: bool) -> FailureEffect;
    async fn snapshot(&self, class: &str) -> Option<BreakerSnapshot>;
}

/// Process-local breakers: one mutex per class inside a concurrent map, so
/// different classes never contend.
pub struct BreakerRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, Arc<Mutex<BreakerState>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Operation classes that have a breaker (i.e. have failed at least once).
    #[must_use]
    pub fn classes(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    /// Forget a class's state (back to closed).
    pub fn reset(&self, class: &str) {
        if self.breakers.remove(class).is_some() {
            info!(circuit = %class, "Circuit breaker reset");
            crate::metrics::set_circuit_state(class, CircuitState::Closed as u8);
        }
    }

    fn get(&self, class: &str) -> Option<Arc<Mutex<BreakerState>>> {
        self.breakers.get(class).map(|e| Arc::clone(e.value()))
    }

    fn get_or_create(&self, class: &str) -> Arc<Mutex<BreakerState>> {
        if let Some(existing) = self.get(class) {
            return existing;
        }
        let entry = self
            .breakers
            .entry(class.to_string())
            .or_insert_with(|| {
                debug!(circuit = %class, "Creating circuit breaker");
                Arc::new(Mutex::new(BreakerState::closed()))
            });
        Arc::clone(entry.value())
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

#[async_trait]
impl BreakerStore for BreakerRegistry {
    async fn admit(&self, class: &str) -> Admission {
        let Some(breaker) = self.get(class) else {
            return Admission::Allowed;
        };
        let admission = breaker.lock().admit(&self.config, Instant::now());
        match admission {
            Admission::Allowed => {}
            Admission::Trial => {
                info!(circuit = %class, "Circuit half-open, allowing one trial call");
                crate::metrics::set_circuit_state(class, CircuitState::HalfOpen as u8);
            }
            Admission::Rejected { retry_in } => {
                debug!(circuit = %class, ?retry_in, "Circuit open, rejecting call");
                crate::metrics::record_circuit_call(class, "rejected");
            }
        }
        admission
    }

    async fn record_success(&self, class: &str) {
        crate::metrics::record_circuit_call(class, "success");
        let Some(breaker) = self.get(class) else {
            return;
        };
        if let Some(previous) = breaker.lock().on_success() {
            info!(circuit = %class, from = %previous, "Circuit closed");
            crate::metrics::set_circuit_state(class, CircuitState::Closed as u8);
        };
    }

    async fn record_failure(&self, class: &str, trips_breaker: bool) -> FailureEffect {
        crate::metrics::record_circuit_call(class, "failure");
        let breaker = self.get_or_create(class);
        let (effect, failures) = {
            let mut state = breaker.lock();
            let effect = state.on_failure(&self.config, trips_breaker, Instant::now());
            (effect, state.consecutive_failures)
        };

        match effect {
            FailureEffect::Tripped => {
                warn!(
                    circuit = %class,
                    failures,
                    cooldown = ?self.config.recovery_timeout,
                    "Circuit breaker opened"
                );
                crate::metrics::record_circuit_trip(class);
                crate::metrics::set_circuit_state(class, CircuitState::Open as u8);
            }
            FailureEffect::Reopened => {
                warn!(circuit = %class, "Half-open trial failed, circuit re-opened");
                crate::metrics::record_circuit_trip(class);
                crate::metrics::set_circuit_state(class, CircuitState::Open as u8);
            }
            FailureEffect::Counted | FailureEffect::Ignored => {}
        }
        effect
    }

    async fn snapshot(&self, class: &str) -> Option<BreakerSnapshot> {
        self.get(class).map(|b| b.lock().snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, cooldown: Duration) -> BreakerRegistry {
        BreakerRegistry::new(CircuitConfig {
            failure_threshold: threshold,
            recovery_timeout: cooldown,
        })
    }

    #[tokio::test]
    async fn test_breaker_created_lazily_on_failure() {
        let breakers = BreakerRegistry::default();
        assert_eq!(breakers.admit("crm.set").await, Admission::Allowed);
        breakers.record_success("crm.set").await;
        assert!(breakers.snapshot("crm.set").await.is_none());

        breakers.record_failure("crm.set", true).await;
        let snap = breakers.snapshot("crm.set").await.unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 1);
        assert!(snap.last_failure_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_exactly_at_threshold() {
        let breakers = registry(5, Duration::from_secs(60));
        for _ in 0..4 {
            assert_eq!(breakers.record_failure("c", true).await, FailureEffect::Counted);
        }
        assert_eq!(breakers.record_failure("c", true).await, FailureEffect::Tripped);
        assert!(matches!(breakers.admit("c").await, Admission::Rejected { .. }));

        // Late failures don't re-trip or extend the window.
        let deadline = breakers.snapshot("c").await.unwrap().next_retry_allowed_after;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breakers.record_failure("c", true).await, FailureEffect::Counted);
        let snap = breakers.snapshot("c").await.unwrap();
        assert_eq!(snap.next_retry_allowed_after, deadline);
        assert_eq!(snap.trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_trial_after_cooldown() {
        let breakers = registry(2, Duration::from_secs(60));
        breakers.record_failure("c", true).await;
        breakers.record_failure("c", true).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(matches!(breakers.admit("c").await, Admission::Rejected { .. }));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breakers.admit("c").await, Admission::Trial);
        assert!(matches!(breakers.admit("c").await, Admission::Rejected { .. }));
        assert_eq!(breakers.snapshot("c").await.unwrap().state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes() {
        let breakers = registry(1, Duration::from_secs(10));
        breakers.record_failure("c", true).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breakers.admit("c").await, Admission::Trial);

        breakers.record_success("c").await;
        let snap = breakers.snapshot("c").await.unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(breakers.admit("c").await, Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens_with_fresh_deadline() {
        let breakers = registry(1, Duration::from_secs(10));
        breakers.record_failure("c", true).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breakers.admit("c").await, Admission::Trial);

        assert_eq!(breakers.record_failure("c", true).await, FailureEffect::Reopened);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(breakers.admit("c").await, Admission::Rejected { .. }));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breakers.admit("c").await, Admission::Trial);
        assert_eq!(breakers.snapshot("c").await.unwrap().trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_trial_frees_slot() {
        let breakers = registry(1, Duration::from_secs(10));
        breakers.record_failure("c", true).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breakers.admit("c").await, Admission::Trial);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breakers.admit("c").await, Admission::Trial);
    }

    #[tokio::test]
    async fn test_non_tripping_failure_resets_count() {
        let breakers = registry(3, Duration::from_secs(60));
        breakers.record_failure("c", true).await;
        breakers.record_failure("c", true).await;
        assert_eq!(breakers.record_failure("c", false).await, FailureEffect::Ignored);
        assert_eq!(breakers.snapshot("c").await.unwrap().consecutive_failures, 0);

        breakers.record_failure("c", true).await;
        breakers.record_failure("c", true).await;
        assert_eq!(breakers.admit("c").await, Admission::Allowed);
    }

    #[tokio::test]
    async fn test_classes_are_independent() {
        let breakers = registry(1, Duration::from_secs(60));
        breakers.record_failure("crm.set", true).await;
        assert!(!breakers.admit("crm.set").await.is_allowed());
        assert!(breakers.admit("crm.get").await.is_allowed());
        assert_eq!(breakers.classes(), vec!["crm.set".to_string()]);

        breakers.reset("crm.set");
        assert!(breakers.admit("crm.set").await.is_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_trip_once() {
        let breakers = Arc::new(registry(5, Duration::from_secs(60)));
        let mut handles = vec![];
        for _ in 0..64 {
            let breakers = breakers.clone();
            handles.push(tokio::spawn(async move { breakers.record_failure("c", true).await }));
        }

        let mut tripped = 0;
        for handle in handles {
            if handle.await.unwrap() == FailureEffect::Tripped {
                tripped += 1;
            }
        }

        assert_eq!(tripped, 1);
        let snap = breakers.snapshot("c").await.unwrap();
        assert_eq!(snap.consecutive_failures, 64);
        assert_eq!(snap.trips, 1);
    }
}
