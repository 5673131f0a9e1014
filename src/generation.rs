//! Text generation backends.
//!
//! Each [`Generator`] sends one system + user message pair and returns the
//! provider's raw JSON. Choosing what to ask, retrying with other prompts,
//! and falling back are the orchestrator's job, not the client's; clients
//! only retry HTTP-level transient failures (`generation.http_retries`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::backend::{post_json_with_retry, BackendError, GenerationRequest, Generator};
use crate::config::GenerationConfig;

/// Build the generator named by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "yandex" => Ok(Arc::new(YandexGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

fn http_client(config: &GenerationConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

fn required_model(config: &GenerationConfig) -> Result<String> {
    config.model.clone().ok_or_else(|| {
        anyhow::anyhow!("generation.model required for {} provider", config.provider)
    })
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _request: &GenerationRequest) -> Result<Value, BackendError> {
        Err(BackendError::Disabled)
    }
}

// ============ OpenAI ============

/// `POST /v1/chat/completions` on OpenAI or a compatible server.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
    http_retries: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        Ok(Self {
            client: http_client(config)?,
            model: required_model(config)?,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            http_retries: config.http_retries,
        })
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError> {
        let body = json!({
            "model": self.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
        });
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        post_json_with_retry("OpenAI", self.http_retries, || {
            self.client.post(&url).bearer_auth(&self.api_key).json(&body)
        })
        .await
    }
}

// ============ Ollama ============

/// `POST /api/chat` on a local Ollama instance, non-streaming.
pub struct OllamaGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
    http_retries: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            model: required_model(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            http_retries: config.http_retries,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError> {
        let body = json!({
            "model": self.model,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
        });
        let url = format!("{}/api/chat", self.url.trim_end_matches('/'));
        post_json_with_retry("Ollama", self.http_retries, || self.client.post(&url).json(&body))
            .await
    }
}

// ============ Yandex ============

const YANDEX_COMPLETION_URL: &str =
    "https://llm.api.cloud.yandex.net/foundationModels/v1/completion";

/// Yandex Foundation Models synchronous completion.
pub struct YandexGenerator {
    client: reqwest::Client,
    model_uri: String,
    folder_id: String,
    api_key: String,
    http_retries: u32,
}

impl YandexGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("YANDEX_API_KEY")
            .context("YANDEX_API_KEY environment variable not set")?;
        let folder_id = config
            .folder_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.folder_id required for yandex provider"))?;
        let model = required_model(config)?;
        Ok(Self {
            client: http_client(config)?,
            model_uri: format!("gpt://{}/{}/latest", folder_id, model),
            folder_id,
            api_key,
            http_retries: config.http_retries,
        })
    }
}

#[async_trait]
impl Generator for YandexGenerator {
    fn name(&self) -> &str {
        "yandex"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError> {
        let body = yandex_body(&self.model_uri, request);
        post_json_with_retry("Yandex", self.http_retries, || {
            self.client
                .post(YANDEX_COMPLETION_URL)
                .header("Authorization", format!("Api-Key {}", self.api_key))
                .header("x-folder-id", &self.folder_id)
                .json(&body)
        })
        .await
    }
}

fn yandex_body(model_uri: &str, request: &GenerationRequest) -> Value {
    json!({
        "modelUri": model_uri,
        "completionOptions": {
            "stream": false,
            "temperature": request.temperature,
            // The API takes maxTokens as a string.
            "maxTokens": request.max_tokens.to_string(),
        },
        "messages": [
            { "role": "system", "text": request.system_prompt },
            { "role": "user", "text": request.user_prompt },
        ],
    })
}
