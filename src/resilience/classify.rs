// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure classification.
//!
//! Remote errors are sorted into a closed set of [`ErrorClass`]es. Each class
//! carries a [`ClassPolicy`] saying whether to retry, how many times, how to
//! back off, and whether the failure counts against the circuit breaker.
//!
//! | class          | retry | max | backoff             | trips breaker |
//! |----------------|-------|-----|---------------------|---------------|
//! | `rate_limited` | yes   | 4   | 1s → 30s            | no            |
//! | `server_error` | yes   | 3   | 500ms → 10s         | yes           |
//! | `network`      | yes   | 3   | 250ms → 5s          | yes           |
//! | `timeout`      | yes   | 2   | 500ms → 5s          | yes           |
//! | `unknown`      | yes   | 1   | 1s → 5s             | yes           |
//! | `permanent`    | no    | 0   | -                   | no            |
//! | `circuit_open` | no    | 0   | -                   | no            |

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::BackoffStrategy;

/// Category of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// HTTP 429 or equivalent
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// Connection refused/reset, DNS, TLS
    Network,
    /// No response within the per-call timeout
    Timeout,
    /// Auth failure, malformed request, other 4xx
    Permanent,
    /// Anything we could not place
    Unknown,
    /// Synthetic: the breaker refused the call, nothing was sent
    CircuitOpen,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 7] = [
        ErrorClass::RateLimited,
        ErrorClass::ServerError,
        ErrorClass::Network,
        ErrorClass::Timeout,
        ErrorClass::Permanent,
        ErrorClass::Unknown,
        ErrorClass::CircuitOpen,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
            Self::CircuitOpen => "circuit_open",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors the executor knows how to sort.
pub trait Classify {
    fn classify(&self) -> ErrorClass;

    /// Server-provided minimum wait before retrying, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Retry behavior for one error class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassPolicy {
    pub retryable: bool,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    /// Counts towards the breaker's consecutive-failure threshold
    pub trips_breaker: bool,
}

impl ClassPolicy {
    const fn retry(max_retries: u32, base_ms: u64, max_ms: u64, jitter: bool, trips_breaker: bool) -> Self {
        Self {
            retryable: true,
            max_retries,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                jitter,
            },
            trips_breaker,
        }
    }

    const fn fail_fast() -> Self {
        Self {
            retryable: false,
            max_retries: 0,
            backoff: BackoffStrategy::None,
            trips_breaker: false,
        }
    }

    /// The reference policy for a class.
    #[must_use]
    pub const fn reference(class: ErrorClass) -> Self {
        match class {
            ErrorClass::RateLimited => Self::retry(4, 1_000, 30_000, true, false),
            ErrorClass::ServerError => Self::retry(3, 500, 10_000, true, true),
            ErrorClass::Network => Self::retry(3, 250, 5_000, true, true),
            ErrorClass::Timeout => Self::retry(2, 500, 5_000, false, true),
            ErrorClass::Unknown => Self::retry(1, 1_000, 5_000, false, true),
            ErrorClass::Permanent | ErrorClass::CircuitOpen => Self::fail_fast(),
        }
    }
}

/// Policy lookup, total over [`ErrorClass`].
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    overrides: HashMap<ErrorClass, ClassPolicy>,
}

impl PolicyTable {
    #[must_use]
    pub fn reference() -> Self {
        Self::default()
    }

    /// Replace the policy for `class`. `CircuitOpen` always fails fast.
    #[must_use]
    pub fn with_policy(mut self, class: ErrorClass, policy: ClassPolicy) -> Self {
        if class != ErrorClass::CircuitOpen {
            self.overrides.insert(class, policy);
        }
        self
    }

    #[must_use]
    pub fn get(&self, class: ErrorClass) -> ClassPolicy {
        self.overrides
            .get(&class)
            .copied()
            .unwrap_or_else(|| ClassPolicy::reference(class))
    }
}

/// A failure after classification, as surfaced to callers and recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{class}: {message}")]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into() }
    }

    pub fn from_error<E: Classify + fmt::Display>(err: &E) -> Self {
        Self::new(err.classify(), err.to_string())
    }

    #[must_use]
    pub fn circuit_open(operation_class: &str) -> Self {
        Self::new(
            ErrorClass::CircuitOpen,
            format!("circuit for '{operation_class}' is open, call not attempted"),
        )
    }

    #[must_use]
    pub fn timed_out(after: Duration) -> Self {
        Self::new(ErrorClass::Timeout, format!("no response within {after:?}"))
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        self.class == ErrorClass::CircuitOpen
    }
}
