// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient execution of remote calls.
//!
//! [`ResilientExecutor::execute_with_retry`] wraps one logical remote
//! operation: it consults the operation class's circuit breaker, runs the
//! call under a timeout, classifies failures, and retries with backoff per
//! the class policy. Every attempt is recorded in the returned
//! [`ExecutionReport`], success or not.
//!
//! ```text
//! admit? ──no──▶ CircuitOpen (0 calls)
//!   │yes
//!   ▼
//! call ──ok──▶ breaker.success ──▶ report(success)
//!   │err
//!   ▼
//! classify ─▶ breaker.failure ─▶ retryable && attempt ≤ max?
//!                                   │yes             │no
//!                                 sleep(backoff)   report(error)
//!                                   └──▶ admit? ...
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::circuit_breaker::{Admission, BreakerRegistry, BreakerSnapshot, BreakerStore};
use super::classify::{Classify, ClassifiedError, ErrorClass, PolicyTable};
use crate::config::SyncConfig;

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based
    pub attempt_number: u32,
    pub classification: ErrorClass,
    /// Wait before the next attempt; `None` if this was the last one
    pub delay_before_next_ms: Option<u64>,
}

/// Result of a resilient execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<ClassifiedError>,
    pub attempts: Vec<AttemptRecord>,
    /// Stopped by the cancellation token
    pub cancelled: bool,
}

impl<T> ExecutionReport<T> {
    fn succeeded(result: T, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            attempts,
            cancelled: false,
        }
    }

    fn failed(error: ClassifiedError, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            attempts,
            cancelled: false,
        }
    }

    fn cancelled(last_error: Option<ClassifiedError>, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            success: false,
            result: None,
            error: last_error,
            attempts,
            cancelled: true,
        }
    }

    /// Number of failed attempts (the successful one is not recorded).
    #[must_use]
    pub fn failed_attempts(&self) -> usize {
        self.attempts.len()
    }

    pub fn into_result(self) -> Result<T, ClassifiedError> {
        match (self.result, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(err)) => Err(err),
            (None, None) => Err(ClassifiedError::new(ErrorClass::Unknown, "cancelled before first attempt")),
        }
    }
}

/// Runs remote operations with classification, backoff and circuit breaking.
///
/// Cheap to share behind an `Arc`; all state lives in the breaker store.
pub struct ResilientExecutor {
    policies: PolicyTable,
    breakers: Arc<dyn BreakerStore>,
    call_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ResilientExecutor {
    pub fn new(policies: PolicyTable, breakers: Arc<dyn BreakerStore>) -> Self {
        Self {
            policies,
            breakers,
            call_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Reference policies with config overrides, process-local breakers.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        let breakers: Arc<dyn BreakerStore> = Arc::new(BreakerRegistry::new(config.circuit_config()));
        Self::new(config.policy_table(), breakers).with_call_timeout(config.call_timeout())
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Abort pending backoff sleeps when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn breaker_snapshot(&self, operation_class: &str) -> Option<BreakerSnapshot> {
        self.breakers.snapshot(operation_class).await
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts its
    /// class's retries, or hits an open breaker.
    ///
    /// `operation` is invoked once per attempt and must be safe to repeat.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        operation_class: &str,
        mut operation: F,
    ) -> ExecutionReport<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut previous_delay = Duration::ZERO;
        let mut last_error: Option<ClassifiedError> = None;
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return ExecutionReport::cancelled(last_error, attempts);
            }

            attempt += 1;

            if let Admission::Rejected { retry_in } = self.breakers.admit(operation_class).await {
                warn!(
                    class = %operation_class,
                    attempt,
                    ?retry_in,
                    "Circuit open, failing fast"
                );
                attempts.push(AttemptRecord {
                    attempt_number: attempt,
                    classification: ErrorClass::CircuitOpen,
                    delay_before_next_ms: None,
                });
                crate::metrics::record_remote_attempt(operation_class, ErrorClass::CircuitOpen.as_str());
                return ExecutionReport::failed(ClassifiedError::circuit_open(operation_class), attempts);
            }

            let outcome = match self.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result.map_err(|e| (ClassifiedError::from_error(&e), e.retry_after())),
                    Err(_) => Err((ClassifiedError::timed_out(limit), None)),
                },
                None => operation()
                    .await
                    .map_err(|e| (ClassifiedError::from_error(&e), e.retry_after())),
            };

            let (error, retry_after) = match outcome {
                Ok(value) => {
                    self.breakers.record_success(operation_class).await;
                    crate::metrics::record_remote_attempt(operation_class, "success");
                    if attempt > 1 {
                        info!(class = %operation_class, attempts = attempt, "Remote call succeeded after retries");
                    }
                    return ExecutionReport::succeeded(value, attempts);
                }
                Err(failure) => failure,
            };

            let class = error.class;
            let policy = self.policies.get(class);
            crate::metrics::record_remote_attempt(operation_class, class.as_str());
            self.breakers
                .record_failure(operation_class, policy.trips_breaker)
                .await;

            let exhausted = !policy.retryable || attempt > policy.max_retries;
            if exhausted {
                attempts.push(AttemptRecord {
                    attempt_number: attempt,
                    classification: class,
                    delay_before_next_ms: None,
                });
                if policy.retryable {
                    warn!(
                        class = %operation_class,
                        error_class = %class,
                        attempts = attempt,
                        error = %error,
                        "Retries exhausted"
                    );
                } else {
                    debug!(class = %operation_class, error_class = %class, error = %error, "Non-retryable failure");
                }
                return ExecutionReport::failed(error, attempts);
            }

            let delay = policy
                .backoff
                .next_delay(attempt, previous_delay)
                .max(retry_after.unwrap_or_default());
            previous_delay = delay;

            attempts.push(AttemptRecord {
                attempt_number: attempt,
                classification: class,
                delay_before_next_ms: Some(delay.as_millis() as u64),
            });
            crate::metrics::record_retry(operation_class, class.as_str());
            warn!(
                class = %operation_class,
                error_class = %class,
                attempt,
                max_retries = policy.max_retries,
                error = %error,
                next_in = ?delay,
                "Remote call failed, retrying"
            );
            last_error = Some(error);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(class = %operation_class, attempt, "Backoff interrupted by cancellation");
                    return ExecutionReport::cancelled(last_error, attempts);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{CircuitConfig, CircuitState};
    use crate::resilience::classify::ClassPolicy;
    use crate::resilience::retry::BackoffStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Fault(ErrorClass, Option<Duration>);

    impl fmt::Display for Fault {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "injected {}", self.0)
        }
    }

    impl Classify for Fault {
        fn classify(&self) -> ErrorClass {
            self.0
        }

        fn retry_after(&self) -> Option<Duration> {
            self.1
        }
    }

    fn executor(threshold: u32) -> ResilientExecutor {
        let breakers = Arc::new(BreakerRegistry::new(CircuitConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(60),
        }));
        ResilientExecutor::new(PolicyTable::reference(), breakers)
    }

    async fn fail_with(
        executor: &ResilientExecutor,
        class: ErrorClass,
        calls: &AtomicU32,
    ) -> ExecutionReport<()> {
        executor
            .execute_with_retry("op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Fault(class, None))
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try_records_nothing() {
        let report = executor(5)
            .execute_with_retry("op", || async { Ok::<_, Fault>(7) })
            .await;
        assert!(report.success);
        assert_eq!(report.result, Some(7));
        assert!(report.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_class_gets_max_retries_plus_one_attempts() {
        for class in [ErrorClass::RateLimited, ErrorClass::ServerError, ErrorClass::Network, ErrorClass::Timeout, ErrorClass::Unknown] {
            let calls = AtomicU32::new(0);
            let report = fail_with(&executor(100), class, &calls).await;
            let expected = ClassPolicy::reference(class).max_retries + 1;
            assert!(!report.success);
            assert_eq!(calls.load(Ordering::SeqCst), expected, "{class}");
            assert_eq!(report.attempts.len() as u32, expected);
            assert_eq!(report.attempts.last().unwrap().delay_before_next_ms, None);
            assert_eq!(report.error.unwrap().class, class);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_fails_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let report = fail_with(&executor(5), ErrorClass::Permanent, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].classification, ErrorClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_midway() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let report = executor(5)
            .execute_with_retry("op", || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(Fault(ErrorClass::Network, None)) } else { Ok(n) }
            })
            .await;
        assert!(report.success);
        assert_eq!(report.result, Some(3));
        assert_eq!(report.attempts.len(), 2);
        assert!(report.attempts.iter().all(|a| a.delay_before_next_ms.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_non_decreasing_and_capped() {
        let calls = AtomicU32::new(0);
        let report = fail_with(&executor(100), ErrorClass::RateLimited, &calls).await;
        let delays: Vec<u64> = report.attempts.iter().filter_map(|a| a.delay_before_next_ms).collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
        assert!(delays.iter().all(|d| *d <= 30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_a_floor() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let report = executor(5)
            .execute_with_retry("op", || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 { Err(Fault(ErrorClass::RateLimited, Some(Duration::from_secs(45)))) } else { Ok(()) }
            })
            .await;
        assert!(report.success);
        assert_eq!(report.attempts[0].delay_before_next_ms, Some(45_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let executor = executor(5);
        let calls = AtomicU32::new(0);
        // Network: 4 attempts, then one more to reach the threshold.
        fail_with(&executor, ErrorClass::Network, &calls).await;
        fail_with(&executor, ErrorClass::Permanent, &calls).await;
        let before = calls.load(Ordering::SeqCst);
        assert_eq!(before, 5);
        // Permanent reset the count; five more tripping failures open it.
        fail_with(&executor, ErrorClass::Network, &calls).await;
        let report = fail_with(&executor, ErrorClass::Network, &calls).await;

        assert_eq!(report.error.as_ref().unwrap().class, ErrorClass::CircuitOpen);
        assert_eq!(report.attempts.last().unwrap().classification, ErrorClass::CircuitOpen);
        let snap = executor.breaker_snapshot("op").await.unwrap();
        assert_eq!(snap.state, CircuitState::Open);

        let calls_before = calls.load(Ordering::SeqCst);
        let report = fail_with(&executor, ErrorClass::Network, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), calls_before);
        assert_eq!(report.attempts.len(), 1);
        assert!(report.error.unwrap().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes_on_success() {
        let executor = executor(1);
        let calls = AtomicU32::new(0);
        let report = fail_with(&executor, ErrorClass::ServerError, &calls).await;
        assert!(report.error.unwrap().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        let report = executor.execute_with_retry("op", || async { Ok::<_, Fault>(()) }).await;
        assert!(report.success);
        assert_eq!(executor.breaker_snapshot("op").await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_classified() {
        let executor = executor(5).with_call_timeout(Some(Duration::from_millis(50)));
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let report = executor
            .execute_with_retry("op", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Fault>(())
            })
            .await;
        assert!(!report.success);
        assert_eq!(report.error.unwrap().class, ErrorClass::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let breakers = Arc::new(BreakerRegistry::default());
        let slow = ClassPolicy {
            retryable: true,
            max_retries: 10,
            backoff: BackoffStrategy::Fixed(Duration::from_secs(3600)),
            trips_breaker: false,
        };
        let executor = ResilientExecutor::new(PolicyTable::reference().with_policy(ErrorClass::Network, slow), breakers)
            .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let calls = AtomicU32::new(0);
        let report = fail_with(&executor, ErrorClass::Network, &calls).await;
        canceller.await.unwrap();

        assert!(report.cancelled);
        assert!(!report.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.error.unwrap().class, ErrorClass::Network);
    }

    #[tokio::test]
    async fn test_into_result() {
        let ok = executor(5).execute_with_retry("op", || async { Ok::<_, Fault>(1) }).await;
        assert_eq!(ok.into_result().unwrap(), 1);
    }
}
