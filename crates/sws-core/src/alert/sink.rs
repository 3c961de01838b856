//! Alert delivery backends.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Alert delivery failures.
#[derive(Debug, Error)]
pub enum AlertError {
    /// The HTTP request failed or timed out.
    #[error("webhook request failed: {0}")]
    Request(String),

    /// The webhook endpoint answered with a non-success status.
    #[error("webhook returned status {0}")]
    Status(u16),
}

/// One-shot JSON POST target.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Post a JSON body to a webhook URL.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError`] on transport failure or a non-success
    /// response. Callers treat every failure as non-fatal.
    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<(), AlertError>;
}

/// Production sink backed by an HTTP client with a short timeout.
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    /// Request timeout for webhook posts.
    pub const TIMEOUT: Duration = Duration::from_secs(5);

    /// Build the sink.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Request`] if the HTTP client cannot be
    /// constructed.
    pub fn new() -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .map_err(|err| AlertError::Request(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AlertSink for HttpSink {
    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<(), AlertError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| AlertError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AlertError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Recording sink for tests.
#[derive(Default)]
pub struct MemorySink {
    posts: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemorySink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything posted so far, in order.
    #[must_use]
    pub fn posts(&self) -> Vec<(String, serde_json::Value)> {
        self.posts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AlertSink for MemorySink {
    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<(), AlertError> {
        self.posts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((url.to_owned(), body.clone()));
        Ok(())
    }
}
