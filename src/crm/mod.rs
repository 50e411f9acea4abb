// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The CRM: system of record for a lead's status.
//!
//! [`CrmClient`] is the remote boundary. Every failure comes back as a
//! [`CrmError`], which knows its own [`ErrorClass`] so the executor can
//! decide whether to retry.
//!
//! - [`http::HttpCrmClient`]: REST adapter (reqwest)
//! - [`memory::InMemoryCrm`]: fault-scriptable stand-in for tests and demos

pub mod http;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::resilience::classify::{Classify, ErrorClass};

pub use http::HttpCrmClient;
pub use memory::InMemoryCrm;

/// Operation class for status writes. One breaker guards all leads.
pub const SET_LEAD_STATUS: &str = "crm.set_lead_status";
/// Operation class for status reads.
pub const GET_LEAD_STATUS: &str = "crm.get_lead_status";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrmError {
    #[error("rate limited by CRM (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("CRM server error (status {status}): {message}")]
    Server { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("CRM request timed out")]
    Timeout,
    #[error("CRM rejected credentials (status {status})")]
    Unauthorized { status: u16 },
    #[error("CRM rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed CRM response: {0}")]
    Malformed(String),
}

impl CrmError {
    /// Map a non-success HTTP status to an error.
    #[must_use]
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: String) -> Self {
        match status {
            429 => Self::RateLimited { retry_after },
            408 => Self::Timeout,
            401 | 403 => Self::Unauthorized { status },
            500..=599 => Self::Server { status, message: body },
            400..=499 => Self::Rejected { status, message: body },
            _ => Self::Malformed(format!("unexpected status {status}")),
        }
    }
}

impl Classify for CrmError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Server { .. } => ErrorClass::ServerError,
            Self::Network(_) => ErrorClass::Network,
            Self::Timeout => ErrorClass::Timeout,
            Self::Unauthorized { .. } | Self::Rejected { .. } => ErrorClass::Permanent,
            Self::Malformed(_) => ErrorClass::Unknown,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Remote CRM operations. Calls must be idempotent: the executor may repeat them.
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Set the lead's status to `status_id`.
    async fn set_lead_status(&self, lead_id: &str, status_id: i64) -> Result<(), CrmError>;

    /// The lead's current status id, `None` if the lead has none (or is unknown).
    async fn get_lead_status(&self, lead_id: &str) -> Result<Option<i64>, CrmError>;
}
