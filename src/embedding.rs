//! Embedding backends.
//!
//! Concrete [`Embedder`] implementations:
//! - **[`DisabledEmbedder`]**: fails every call; used when no provider is configured.
//! - **[`OpenAiEmbedder`]**: `POST /v1/embeddings` on OpenAI or a compatible server.
//! - **[`OllamaEmbedder`]**: `POST /api/embed` on a local Ollama instance.
//! - **[`YandexEmbedder`]**: Yandex Foundation Models `textEmbedding`, with
//!   separate document and query models.
//! - **`LocalEmbedder`**: offline fastembed models (feature `local-embeddings-fastembed`).
//!
//! # Provider Selection
//!
//! | Config Value | Embedder |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledEmbedder`] |
//! | `"openai"` | [`OpenAiEmbedder`] (`OPENAI_API_KEY`) |
//! | `"ollama"` | [`OllamaEmbedder`] |
//! | `"yandex"` | [`YandexEmbedder`] (`YANDEX_API_KEY`) |
//! | `"local"` | `LocalEmbedder` |
//!
//! HTTP providers retry 429/5xx and network errors with exponential
//! backoff (see [`crate::backend`]); other 4xx responses fail at once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::backend::{post_json_with_retry, BackendError, Embedder};
use crate::config::EmbeddingConfig;

/// Build the embedder named by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "yandex" => Ok(Arc::new(YandexEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(local::LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

fn required_model(config: &EmbeddingConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", config.provider))
}

fn required_dims(config: &EmbeddingConfig) -> Result<usize> {
    config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", config.provider))
}

fn check_count(expected: usize, got: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, BackendError> {
    if got.len() != expected {
        return Err(BackendError::Malformed(format!(
            "expected {} embeddings, got {}",
            expected,
            got.len()
        )));
    }
    Ok(got)
}

fn json_to_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        Err(BackendError::Disabled)
    }
}

// ============ OpenAI ============

/// OpenAI (or API-compatible) embeddings.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        Ok(Self {
            client: http_client(config)?,
            model: required_model(config)?,
            dims: required_dims(config)?,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let json = post_json_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;
        check_count(texts.len(), parse_openai_response(&json)?)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, BackendError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| BackendError::Malformed("OpenAI response missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let vector = item
            .get("embedding")
            .and_then(json_to_vector)
            .ok_or_else(|| BackendError::Malformed("OpenAI response missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embeddings from a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            model: required_model(config)?,
            dims: required_dims(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let json =
            post_json_with_retry("Ollama", self.max_retries, || self.client.post(&url).json(&body))
                .await?;
        check_count(texts.len(), parse_ollama_response(&json)?)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, BackendError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| BackendError::Malformed("Ollama response missing embeddings array".into()))?;

    embeddings
        .iter()
        .map(|e| {
            json_to_vector(e).ok_or_else(|| {
                BackendError::Malformed("Ollama embedding is not an array".into())
            })
        })
        .collect()
}

// ============ Yandex ============

const YANDEX_EMBEDDING_URL: &str =
    "https://llm.api.cloud.yandex.net/foundationModels/v1/textEmbedding";

/// Yandex Foundation Models embeddings.
///
/// The API embeds one text per request. Documents use the configured model
/// (default `text-search-doc`); queries use its `-query` counterpart.
pub struct YandexEmbedder {
    client: reqwest::Client,
    folder_id: String,
    doc_model: String,
    query_model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
}

impl YandexEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("YANDEX_API_KEY")
            .context("YANDEX_API_KEY environment variable not set")?;
        let folder_id = config
            .folder_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.folder_id required for yandex provider"))?;
        let doc_model = config
            .model
            .clone()
            .unwrap_or_else(|| "text-search-doc".to_string());
        let query_model = doc_model.replace("-doc", "-query");
        Ok(Self {
            client: http_client(config)?,
            folder_id,
            doc_model,
            query_model,
            dims: config.dims.unwrap_or(256),
            api_key,
            max_retries: config.max_retries,
        })
    }

    async fn embed_one(&self, model: &str, text: &str) -> Result<Vec<f32>, BackendError> {
        let body = serde_json::json!({
            "modelUri": format!("emb://{}/{}/latest", self.folder_id, model),
            "text": text,
        });
        let json = post_json_with_retry("Yandex", self.max_retries, || {
            self.client
                .post(YANDEX_EMBEDDING_URL)
                .header("Authorization", format!("Api-Key {}", self.api_key))
                .header("x-folder-id", &self.folder_id)
                .json(&body)
        })
        .await?;
        json.get("embedding")
            .and_then(json_to_vector)
            .ok_or_else(|| BackendError::Malformed("Yandex response missing embedding".into()))
    }
}

#[async_trait]
impl Embedder for YandexEmbedder {
    fn model_name(&self) -> &str {
        &self.doc_model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_one(&self.doc_model, text).await?);
        }
        Ok(out)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.embed_one(&self.query_model, text).await
    }
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use std::sync::{Arc, Mutex};

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use crate::backend::{BackendError, Embedder};
    use crate::config::EmbeddingConfig;

    /// Offline embeddings. The model is downloaded on first use and kept loaded.
    pub struct LocalEmbedder {
        model_name: String,
        model: fastembed::EmbeddingModel,
        dims: usize,
        batch_size: usize,
        loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "multilingual-e5-small".to_string());
            let (model, default_dims) = match model_name.as_str() {
                "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
                "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
                "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
                "multilingual-e5-small" => (fastembed::EmbeddingModel::MultilingualE5Small, 384),
                "multilingual-e5-base" => (fastembed::EmbeddingModel::MultilingualE5Base, 768),
                "multilingual-e5-large" => (fastembed::EmbeddingModel::MultilingualE5Large, 1024),
                other => bail!(
                    "Unknown local embedding model: '{}'. Supported: all-minilm-l6-v2, \
                     bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small, \
                     multilingual-e5-base, multilingual-e5-large",
                    other
                ),
            };
            Ok(Self {
                model_name,
                model,
                dims: config.dims.unwrap_or(default_dims),
                batch_size: config.batch_size,
                loaded: Arc::new(Mutex::new(None)),
            })
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }
        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            let loaded = Arc::clone(&self.loaded);
            let model = self.model.clone();
            let batch_size = self.batch_size;
            let texts = texts.to_vec();

            tokio::task::spawn_blocking(move || {
                let mut guard = loaded.lock().unwrap_or_else(|p| p.into_inner());
                if guard.is_none() {
                    let init = fastembed::InitOptions::new(model).with_show_download_progress(false);
                    let te = fastembed::TextEmbedding::try_new(init).map_err(|e| {
                        BackendError::Rejected(format!("failed to load local model: {}", e))
                    })?;
                    *guard = Some(te);
                }
                match guard.as_mut() {
                    Some(te) => te
                        .embed(texts, Some(batch_size))
                        .map_err(|e| BackendError::Transient(format!("local embedding failed: {}", e))),
                    None => Err(BackendError::Disabled),
                }
            })
            .await
            .map_err(|e| BackendError::Transient(format!("embedding task panicked: {}", e)))?
        }
    }
}
