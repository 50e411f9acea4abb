// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff strategies and a simple retry helper.
//!
//! [`BackoffStrategy`] computes the wait between attempts of a classified
//! remote call (see [`super::executor`]). [`RetryConfig`] + [`retry`] is the
//! plain loop used for local infrastructure such as connecting to the outcome
//! database at startup.
//!
//! # Example
//!
//! ```
//! use lead_sync::{BackoffStrategy, RetryConfig};
//! use std::time::Duration;
//!
//! let backoff = BackoffStrategy::Exponential {
//!     base: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(1),
//!     jitter: false,
//! };
//! assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay_for(10), Duration::from_secs(1));
//!
//! // Startup: fail fast on bad config
//! assert_eq!(RetryConfig::startup().max_retries, Some(5));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// How long to wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Retry immediately
    None,
    Fixed(Duration),
    /// `base × 2^(attempt-1)`, capped at `max_delay`
    Exponential {
        base: Duration,
        max_delay: Duration,
        jitter: bool,
    },
}

impl BackoffStrategy {
    /// Deterministic delay after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => d,
            Self::Exponential { base, max_delay, .. } => {
                let exponent = attempt.saturating_sub(1).min(31);
                base.saturating_mul(1_u32 << exponent).min(max_delay)
            }
        }
    }

    /// Delay to actually sleep after the `attempt`-th failure.
    ///
    /// With jitter the delay is drawn from `[d/2, d]`, then raised to at least
    /// `previous` so successive waits never shrink. Never exceeds the cap.
    #[must_use]
    pub fn next_delay(&self, attempt: u32, previous: Duration) -> Duration {
        let delay = self.delay_for(attempt);
        match *self {
            Self::Exponential { jitter: true, max_delay, .. } if !delay.is_zero() => {
                let half = delay / 2;
                let spread = rand::thread_rng().gen_range(0.0..=1.0);
                (half + half.mul_f64(spread)).max(previous).min(max_delay)
            }
            _ => delay.max(previous),
        }
    }

    /// Turn jitter off unless `allowed`. Never turns it on.
    #[must_use]
    pub fn allow_jitter(self, allowed: bool) -> Self {
        match self {
            Self::Exponential { base, max_delay, jitter } => Self::Exponential {
                base,
                max_delay,
                jitter: jitter && allowed,
            },
            other => other,
        }
    }
}

/// Configuration for local infrastructure retries.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::query()`] - Quick retry for individual statements
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl RetryConfig {
    /// 5 attempts, failing after a few seconds. Surfaces a bad database URL
    /// at startup instead of hanging.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// 3 attempts with fast backoff, then let the caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Run `operation` until it succeeds or `config.max_retries` attempts fail.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if config.max_retries.is_some_and(|max| attempts >= max) {
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    next_in = ?delay,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}
