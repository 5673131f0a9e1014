//! Shared mock backends and fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use answer_gate::backend::{BackendError, Embedder, GenerationRequest, Generator};
use answer_gate::config::{Config, FilesystemSourceConfig};
use answer_gate::extract::DefaultExtractor;
use answer_gate::index_store::{IndexHandle, IndexStore};
use answer_gate::sources::create_source;
use answer_gate::updater::IndexUpdater;
use async_trait::async_trait;
use serde_json::{json, Value};

const VOCABULARY: &[&str] = &[
    "margarita", "tequila", "lime", "mojito", "rum", "mint", "negroni", "gin", "campari",
];

/// Bag-of-words embedder over a fixed bar vocabulary, plus a small bias
/// component so no text maps to the zero vector.
#[derive(Default)]
pub struct KeywordEmbedder {
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = VOCABULARY
            .iter()
            .map(|w| lower.matches(w).count() as f32)
            .collect();
        v.push(0.1);
        v
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    fn dims(&self) -> usize {
        VOCABULARY.len() + 1
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Answers classifier prompts with `classifier_reply` and everything else
/// with `answer`, recording every request.
pub struct ScriptedGenerator {
    answer: Option<String>,
    classifier_reply: Option<String>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(answer.to_string()),
            classifier_reply: Some("SAFE".to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Classifier calls fail with a transient error.
    pub fn with_broken_classifier(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(answer.to_string()),
            classifier_reply: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests other than moderation classifier calls.
    pub fn answer_requests(&self) -> Vec<GenerationRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !is_classifier(r))
            .collect()
    }
}

fn is_classifier(request: &GenerationRequest) -> bool {
    request.system_prompt.contains("content safety classifier")
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = if is_classifier(request) {
            &self.classifier_reply
        } else {
            &self.answer
        };
        match reply {
            Some(text) => Ok(json!({
                "result": {
                    "alternatives": [{ "message": { "role": "assistant", "text": text } }]
                }
            })),
            None => Err(BackendError::Transient("503 service unavailable".to_string())),
        }
    }
}

pub fn write_doc(root: &Path, key: &str, body: &str) {
    let path = root.join(key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
}

/// Config reading documents from `docs` and writing the index to `index`.
pub fn config(docs: &Path, index: &Path) -> Config {
    let mut config = Config::default();
    config.index.dir = index.to_path_buf();
    config.source.filesystem = Some(FilesystemSourceConfig {
        root: docs.to_path_buf(),
        include_globs: vec!["**/*.txt".into(), "**/*.json".into(), "**/*.md".into()],
        exclude_globs: Vec::new(),
        follow_symlinks: false,
    });
    config.generation.retry_backoff_ms = 0;
    config
}

pub fn handle(config: &Config) -> Arc<IndexHandle> {
    Arc::new(IndexHandle::new(
        IndexStore::new(&config.index.dir),
        Duration::from_secs(config.index.cache_ttl_secs),
    ))
}

pub fn updater(
    config: &Config,
    embedder: Arc<KeywordEmbedder>,
    handle: Arc<IndexHandle>,
) -> IndexUpdater {
    IndexUpdater::new(
        create_source(&config.source).unwrap(),
        Arc::new(DefaultExtractor),
        embedder,
        handle,
        config,
    )
}
