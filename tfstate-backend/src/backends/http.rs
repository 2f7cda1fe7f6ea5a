//! Shared plumbing for the HTTP-based backends

use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendError, BackendResult};
use crate::pool::ConnectionFactory;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces `reqwest` clients for a [`crate::pool::ConnectionPool`]
pub struct HttpClientFactory {
    timeout: Duration,
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self {
            timeout: REQUEST_TIMEOUT,
        }
    }
}

#[async_trait]
impl ConnectionFactory for HttpClientFactory {
    type Connection = reqwest::Client;

    async fn connect(&self) -> BackendResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("tfstate-backend/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::configuration(format!("Failed to build HTTP client: {}", e)))
    }
}

/// Map a transport failure (no response received)
pub(crate) fn transport_error(backend: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(format!("{}: {}", backend, err))
    } else if err.is_connect() {
        BackendError::Unavailable(format!("{}: connection failed: {}", backend, err))
    } else {
        BackendError::storage(backend, err.to_string())
    }
}

/// Map an unexpected response to an error carrying its status and body
pub(crate) async fn status_error(backend: &str, response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    let message = if body.is_empty() {
        format!("{} returned {}", backend, status)
    } else {
        format!("{} returned {}: {}", backend, status, body)
    };
    BackendError::from_status(status, message)
}

/// Parse an HTTP date (`Last-Modified`)
pub(crate) fn parse_http_date(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}
