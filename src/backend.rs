//! Seams to the external model backends.
//!
//! The request path and the index updater talk to embedding and text
//! generation services only through the [`Embedder`] and [`Generator`]
//! traits. Concrete HTTP clients live in [`crate::embedding`] and
//! [`crate::generation`]; tests substitute in-process mocks.
//!
//! Every backend call made by this crate is wrapped in [`with_timeout`],
//! and a timeout is reported as [`BackendError::Timeout`] so callers can
//! treat it like any other failure of that call.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Worth retrying: network errors, HTTP 429 and 5xx.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Not worth retrying: other HTTP 4xx responses.
    #[error("backend rejected the request: {0}")]
    Rejected(String),

    #[error("backend is disabled")]
    Disabled,

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout(_) | BackendError::Transient(_))
    }
}

/// Embedding model client.
///
/// Implementations are assumed deterministic: the same text always maps
/// to the same vector for a given model. Incremental index updates rely
/// on that to mix old and new rows.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Configured output dimension, or 0 when unknown until the first call.
    fn dims(&self) -> usize;

    /// Embed a batch of document texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;

    /// Embed a search query. Providers with separate query models override this.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Malformed("empty embedding response".to_string()))
    }
}

/// One chat-style completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Text generation client.
///
/// Returns the provider's raw JSON response. Response shapes differ
/// between providers and versions, so text is pulled out afterwards by a
/// [`crate::response::ResponseAdapter`].
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError>;
}

/// Run `fut` with a deadline.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}

/// POST a JSON request, retrying transient failures with exponential backoff.
///
/// - HTTP 2xx → parsed JSON body
/// - HTTP 429 or 5xx → retry
/// - other HTTP 4xx → [`BackendError::Rejected`] immediately
/// - network error → retry
/// - backoff: 1s, 2s, 4s, … capped at 32s
pub(crate) async fn post_json_with_retry<F>(
    label: &str,
    max_retries: u32,
    build: F,
) -> Result<Value, BackendError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json::<Value>().await.map_err(|e| {
                        BackendError::Malformed(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(500)
                    .collect();
                let message = format!("{} API error {}: {}", label, status, body);

                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(attempt, status = status.as_u16(), "{} request failed, will retry", label);
                    last_err = Some(BackendError::Transient(message));
                    continue;
                }
                return Err(BackendError::Rejected(message));
            }
            Err(e) => {
                warn!(attempt, error = %e, "{} connection error", label);
                last_err = Some(BackendError::Transient(format!(
                    "{} connection error: {}",
                    label, e
                )));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| BackendError::Transient(format!("{} failed after retries", label))))
}
