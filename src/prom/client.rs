use reqwest::header::{HeaderName, HeaderValue, ACCEPT};
use secrecy::ExposeSecret;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::types::{EditResponse, ProductUpdate};
use crate::config::{ConfigError, Settings};
use crate::util::RetryPolicy;

pub const PROM_USER_AGENT: &str = concat!("prom-feed-sync/", env!("CARGO_PKG_VERSION"));

/// Longest response snippet kept in error messages.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Error)]
pub enum PromError {
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    #[error("HTTP error: status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("API token contains characters not allowed in an HTTP header")]
    InvalidToken,
}

impl PromError {
    /// Returns true if this error is transient and the request should be retried.
    fn is_retryable(&self) -> bool {
        match self {
            PromError::Timeout(_) | PromError::Network(_) => true,
            PromError::HttpStatus { status, .. } => *status >= 500,
            PromError::RateLimited(_) | PromError::Config(_) | PromError::InvalidToken => false,
        }
    }
}

/// What Prom did with one batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchOutcome {
    /// Items Prom did not list under `errors`.
    pub accepted: usize,
    /// `(id, reason)` for each item Prom refused.
    pub rejected: Vec<(String, String)>,
}

/// Client for the Prom product edit endpoint.
///
/// The auth header value is built once and marked sensitive so it never
/// shows up in reqwest's debug output.
#[derive(Debug, Clone)]
pub struct PromClient {
    http: reqwest::Client,
    update_url: Url,
    auth_header: HeaderName,
    auth_value: HeaderValue,
    timeout: Duration,
    retry: RetryPolicy,
}

impl PromClient {
    /// Builds a client from resolved settings.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingToken`] (wrapped) when no token is configured,
    /// [`PromError::InvalidToken`] when the token cannot be sent as a header.
    pub fn new(settings: &Settings) -> Result<Self, PromError> {
        let token = settings.token()?;

        let raw = if settings.prom_auth_scheme.is_empty() {
            token.expose_secret().to_string()
        } else {
            format!("{} {}", settings.prom_auth_scheme, token.expose_secret())
        };
        let mut auth_value = HeaderValue::from_str(&raw).map_err(|_| PromError::InvalidToken)?;
        auth_value.set_sensitive(true);

        let http = reqwest::Client::builder()
            .user_agent(PROM_USER_AGENT)
            .timeout(settings.http_timeout)
            .build()?;

        Ok(Self {
            http,
            update_url: settings.update_url.clone(),
            auth_header: settings.prom_auth_header.clone(),
            auth_value,
            timeout: settings.http_timeout,
            // 5 attempts in total
            retry: RetryPolicy::new(4, Duration::from_secs(2)),
        })
    }

    /// Replaces the retry schedule.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn update_url(&self) -> &Url {
        &self.update_url
    }

    /// Sends one batch of updates.
    ///
    /// Network errors, timeouts, 429 and 5xx responses are retried with
    /// exponential backoff. Edits set absolute values, so a retried request
    /// that already landed does no harm.
    pub async fn update_products(&self, batch: &[ProductUpdate]) -> Result<BatchOutcome, PromError> {
        let mut retry_count = 0;

        loop {
            match self.send_once(batch).await {
                Ok(outcome) => return Ok(outcome),
                Err(PromError::RateLimited(_)) if self.retry.can_retry(retry_count) => {
                    let delay = self.retry.delay(retry_count);
                    tracing::warn!(
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Prom rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(PromError::RateLimited(_)) => {
                    return Err(PromError::RateLimited(self.retry.max_retries))
                }
                Err(e) if e.is_retryable() && self.retry.can_retry(retry_count) => {
                    let delay = self.retry.delay(retry_count);
                    tracing::warn!(
                        error = %e,
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying Prom update after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, batch: &[ProductUpdate]) -> Result<BatchOutcome, PromError> {
        let request = self
            .http
            .post(self.update_url.clone())
            .header(self.auth_header.clone(), self.auth_value.clone())
            .header(ACCEPT, "application/json")
            .json(batch);

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| PromError::Timeout(self.timeout.as_secs()))?
            .map_err(PromError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PromError::RateLimited(0));
        }

        let body = response.text().await?;

        if !status.is_success() {
            return Err(PromError::HttpStatus {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        Ok(outcome_from_body(batch.len(), &body))
    }
}

/// Interprets a 2xx body. Anything that is not a recognizable edit
/// response counts as every item accepted.
fn outcome_from_body(batch_len: usize, body: &str) -> BatchOutcome {
    let response: EditResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, body = %truncate_body(body), "Unrecognized Prom response body");
            EditResponse::default()
        }
    };

    let rejected = response.rejections();
    for (id, reason) in &rejected {
        tracing::debug!(id = %id, reason = %reason, "Prom rejected update");
    }

    BatchOutcome {
        accepted: batch_len.saturating_sub(rejected.len()),
        rejected,
    }
}

fn truncate_body(body: &str) -> String {
    if body.is_empty() {
        return "<empty>".to_string();
    }
    body.chars().take(MAX_ERROR_BODY).collect()
}
