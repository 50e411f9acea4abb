// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! REST adapter for the CRM.
//!
//! - `PUT {base}/leads/{id}/status` with `{"status_id": n}`
//! - `GET {base}/leads/{id}/status` returning `{"status_id": n | null}`; 404 = no status
//!
//! This client makes exactly one request per call. Retries belong to the
//! executor, which sees the [`CrmError`] classification.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CrmClient, CrmError};
use crate::config::{ConfigError, SyncConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct StatusBody {
    status_id: Option<i64>,
}

pub struct HttpCrmClient {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpCrmClient {
    pub fn new(base_url: &str, token: Option<String>, request_timeout: Option<Duration>) -> Result<Self, ConfigError> {
        let base = Url::parse(base_url)
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint(format!("{base_url}: not an http(s) base URL")));
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
            .build()
            .map_err(|e| ConfigError::InvalidEndpoint(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base, token })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .crm_base_url
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidEndpoint("crm_base_url is not set".into()))?;
        Self::new(base_url, config.crm_api_token.clone(), config.call_timeout())
    }

    /// `{base}/leads/{lead_id}/status`, with the id percent-encoded as one segment.
    fn lead_status_url(&self, lead_id: &str) -> Result<Url, CrmError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| CrmError::Malformed(format!("base URL {} cannot take a path", self.base)))?
            .pop_if_empty()
            .extend(["leads", lead_id, "status"]);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn map_send_error(err: reqwest::Error) -> CrmError {
    if err.is_timeout() {
        CrmError::Timeout
    } else if err.is_decode() {
        CrmError::Malformed(err.to_string())
    } else {
        CrmError::Network(err.to_string())
    }
}

fn retry_after_hint(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn error_from_response(response: Response) -> CrmError {
    let status = response.status().as_u16();
    let retry_after = retry_after_hint(&response);
    let body = response.text().await.unwrap_or_default();
    CrmError::from_status(status, retry_after, body)
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    #[tracing::instrument(skip(self), fields(crm = %self.base))]
    async fn set_lead_status(&self, lead_id: &str, status_id: i64) -> Result<(), CrmError> {
        let url = self.lead_status_url(lead_id)?;
        let response = self
            .authorize(self.client.put(url))
            .json(&StatusBody { status_id: Some(status_id) })
            .send()
            .await
            .map_err(map_send_error)?;

        if response.status().is_success() {
            debug!("CRM status updated");
            return Ok(());
        }
        Err(error_from_response(response).await)
    }

    #[tracing::instrument(skip(self), fields(crm = %self.base))]
    async fn get_lead_status(&self, lead_id: &str) -> Result<Option<i64>, CrmError> {
        let url = self.lead_status_url(lead_id)?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(map_send_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body: StatusBody = response
                    .json()
                    .await
                    .map_err(|e| CrmError::Malformed(e.to_string()))?;
                Ok(body.status_id)
            }
            _ => Err(error_from_response(response).await),
        }
    }
}
