//! Site transport.
//!
//! [`SiteClient`] is the seam between the collector and the network. The
//! HTTP implementation posts a [`SiteRequest`] to `{endpoint}/aggregate`
//! and expects a [`SiteAggregate`] back.

use crate::error::ErrorKind;
use crate::models::{GroupBy, SiteAggregate};
use crate::resolver::{FederationMember, Measurement, ResolvedFilter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// What one site is asked to compute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRequest {
    pub federation_id: String,
    pub measurement: Measurement,
    pub group_by: GroupBy,
    /// Groups of the scope this site contributes to.
    pub groups: Vec<String>,
    pub filters: Vec<ResolvedFilter>,
}

/// Failure of a single site fetch.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct SiteError {
    pub kind: ErrorKind,
    pub message: String,
    /// Worth one more attempt.
    pub transient: bool,
}

impl SiteError {
    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            transient: false,
        }
    }
}

/// Fetches one site's partial aggregates.
#[async_trait]
pub trait SiteClient: Send + Sync {
    async fn fetch(
        &self,
        member: &FederationMember,
        request: &SiteRequest,
    ) -> std::result::Result<SiteAggregate, SiteError>;
}

/// `SiteClient` over HTTP.
pub struct HttpSiteClient {
    http_client: reqwest::Client,
}

impl HttpSiteClient {
    /// `timeout` bounds a whole request; the collector applies its own
    /// per-site deadline on top.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl SiteClient for HttpSiteClient {
    async fn fetch(
        &self,
        member: &FederationMember,
        request: &SiteRequest,
    ) -> std::result::Result<SiteAggregate, SiteError> {
        let url = format!("{}/aggregate", member.endpoint.trim_end_matches('/'));
        debug!("POST {} for site {}", url, member.id);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SiteError::permanent(ErrorKind::Timeout, format!("Request to {} timed out", url))
                } else if e.is_connect() {
                    SiteError::transient(
                        ErrorKind::TransportError,
                        format!("Cannot connect to site at {}", member.endpoint),
                    )
                } else {
                    SiteError::transient(
                        ErrorKind::TransportError,
                        format!("Failed to send request: {}", e),
                    )
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let body = response.text().await.map_err(|e| {
            SiteError::transient(
                ErrorKind::TransportError,
                format!("Failed to read response body: {}", e),
            )
        })?;
        if body.trim().is_empty() {
            return Err(SiteError::permanent(
                ErrorKind::EmptyResponse,
                "Site answered with an empty body",
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            SiteError::permanent(
                ErrorKind::CorruptAggregate,
                format!("Failed to parse site aggregate: {}", e),
            )
        })
    }
}

/// Map a non-success response. 5xx and 429 are worth a retry.
pub fn classify_status(status: u16, body: &str) -> SiteError {
    let body = body.trim();
    let kind = ErrorKind::from_http_status(status, body.is_empty());
    let transient = status >= 500 || status == 429;
    let message = if body.is_empty() {
        format!("Site answered HTTP {} with no body", status)
    } else {
        format!("Site answered HTTP {}: {}", status, body)
    };
    SiteError {
        kind,
        message,
        transient,
    }
}
