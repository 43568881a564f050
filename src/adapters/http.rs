//! HTTP-backed collaborators: a processing endpoint for worker loops and a
//! webhook for daily maintenance.
//!
//! Both POST JSON and authenticate with an optional bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, FetchError};
use crate::ingest::MaintenanceTask;
use crate::queue::{ProcessOutcome, Processor};

#[derive(Serialize)]
struct ProcessRequest<'a> {
    payload_ref: &'a str,
}

#[derive(Deserialize)]
struct ProcessResponse {
    result: Option<String>,
}

fn build_client(timeout: Duration, key: &str) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

fn validate_url(url: &str, key: &str) -> Result<String, ConfigError> {
    reqwest::Url::parse(url)
        .map(|u| u.to_string())
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{url}: {e}"),
        })
}

/// Decide what a non-success status means for the item.
///
/// Rejections of the payload itself are permanent; throttling, timeouts and
/// server errors are worth another attempt.
pub fn classify_status(status: StatusCode) -> Option<bool> {
    if status.is_success() {
        return None;
    }
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    Some(retryable)
}

/// Turn a success body into result data: the `result` field of a JSON
/// object if present, otherwise the raw text.
fn result_from_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ProcessResponse>(trimmed) {
        Ok(parsed) => parsed.result,
        Err(_) => Some(trimmed.to_string()),
    }
}

/// Sends each payload to a processing endpoint (summarizer, vision analyzer).
pub struct HttpProcessor {
    name: String,
    url: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpProcessor {
    /// The client timeout is a backstop; the worker loop enforces its own
    /// per-attempt timeout as well.
    pub fn new(
        name: impl Into<String>,
        url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        Ok(Self {
            url: validate_url(url, &name)?,
            client: build_client(timeout, &name)?,
            name,
            api_key,
        })
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, payload_ref: &str) -> ProcessOutcome {
        let mut request = self
            .client
            .post(&self.url)
            .json(&ProcessRequest { payload_ref });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => return ProcessOutcome::Retryable(format!("{} unreachable: {e}", self.name)),
        };

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match classify_status(status) {
            None => ProcessOutcome::Success(result_from_body(&body)),
            Some(true) => ProcessOutcome::Retryable(format!("{} answered {status}", self.name)),
            Some(false) => ProcessOutcome::Permanent(format!(
                "{} rejected payload ({status}): {}",
                self.name,
                body.trim()
            )),
        }
    }
}

/// Daily maintenance performed by calling a webhook.
pub struct HttpHook {
    url: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpHook {
    pub fn new(
        url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            url: validate_url(url, "maintenance hook")?,
            client: build_client(timeout, "maintenance hook")?,
            api_key,
        })
    }
}

#[async_trait]
impl MaintenanceTask for HttpHook {
    fn name(&self) -> &str {
        "maintenance-hook"
    }

    async fn run(&self) -> Result<(), FetchError> {
        let mut request = self.client.post(&self.url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let resp = request.send().await.map_err(|e| FetchError::Request {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
