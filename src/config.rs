//! TOML configuration.
//!
//! Every section and field has a default, so an empty file is a valid
//! (if not very useful) configuration. [`load_config`] parses and then
//! validates the values that would otherwise fail late at request time.
//!
//! ```toml
//! [index]
//! dir = "./data/index"
//!
//! [source.filesystem]
//! root = "./docs"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [generation]
//! provider = "ollama"
//! model = "llama3.1"
//!
//! [rate_limit]
//! rpm = 10
//! window_secs = 60
//! cooldown_secs = 15
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::moderation::FailurePolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

// ============ Index ============

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
    /// How long a loaded index snapshot is served before it is re-read from disk.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/index")
}
fn default_cache_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    answer_gate_core::chunk::DEFAULT_MAX_CHARS
}

// ============ Sources ============

/// Exactly one of the source kinds must be configured for index updates.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub filesystem: Option<FilesystemSourceConfig>,
    pub s3: Option<S3SourceConfig>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            filesystem: None,
            s3: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3SourceConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_include_globs() -> Vec<String> {
    ["**/*.txt", "**/*.md", "**/*.json", "**/*.csv", "**/*.pdf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_region() -> String {
    "us-east-1".to_string()
}

// ============ Backends ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, OpenAI-compatible servers).
    #[serde(default)]
    pub url: Option<String>,
    /// Yandex Cloud folder id.
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            folder_id: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_compact_max_tokens")]
    pub compact_max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total prompt-rotation attempts before the compact fallback.
    #[serde(default = "default_generation_retries")]
    pub max_retries: usize,
    /// Fixed delay between rotation attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// HTTP-level retries for 429/5xx inside a single attempt.
    #[serde(default)]
    pub http_retries: u32,
    /// Persona prompts tried in order; empty means the built-in set.
    #[serde(default)]
    pub persona_variants: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            folder_id: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            compact_max_tokens: default_compact_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_generation_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            http_retries: 0,
            persona_variants: Vec::new(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_compact_max_tokens() -> u32 {
    220
}
fn default_generation_retries() -> usize {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

// ============ Request path ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum cosine score for a hit to count as strong context.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,
    /// Keep only the best chunk per source document.
    #[serde(default = "default_true")]
    pub dedupe_by_source: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            relevance_threshold: default_relevance_threshold(),
            dedupe_by_source: true,
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_relevance_threshold() -> f32 {
    0.3
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rpm")]
    pub rpm: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpm: default_rpm(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_rpm() -> usize {
    10
}
fn default_window_secs() -> u64 {
    60
}
fn default_cooldown_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModerationConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Ask the generation backend when the pattern check is undecided.
    #[serde(default = "default_true")]
    pub model_check: bool,
    /// Subject area the classifier treats as on-topic and safe.
    #[serde(default = "default_domain_hint")]
    pub domain_hint: String,
    #[serde(default)]
    pub extra_deny_patterns: Vec<String>,
    #[serde(default)]
    pub extra_allow_patterns: Vec<String>,
    #[serde(default = "default_moderation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            model_check: true,
            domain_hint: default_domain_hint(),
            extra_deny_patterns: Vec::new(),
            extra_allow_patterns: Vec::new(),
            timeout_secs: default_moderation_timeout_secs(),
        }
    }
}

fn default_domain_hint() -> String {
    "cocktails, drinks, bar craft and recipes".to_string()
}
fn default_moderation_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("./data/audit.jsonl")
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }

    let rl = &config.rate_limit;
    if rl.rpm == 0 {
        bail!("rate_limit.rpm must be >= 1");
    }
    if rl.window_secs == 0 {
        bail!("rate_limit.window_secs must be >= 1");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.relevance_threshold) {
        bail!("retrieval.relevance_threshold must be in [-1.0, 1.0]");
    }

    if config.generation.max_retries == 0 {
        bail!("generation.max_retries must be >= 1");
    }

    if config.source.filesystem.is_some() && config.source.s3.is_some() {
        bail!("configure only one of source.filesystem and source.s3");
    }

    let emb = &config.embedding;
    match emb.provider.as_str() {
        "disabled" | "openai" | "ollama" | "yandex" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, yandex, or local.",
            other
        ),
    }
    if emb.is_enabled() && emb.provider != "local" {
        if emb.dims.is_none() || emb.dims == Some(0) {
            bail!("embedding.dims must be > 0 when provider is '{}'", emb.provider);
        }
        if emb.model.is_none() {
            bail!("embedding.model must be specified when provider is '{}'", emb.provider);
        }
    }
    if emb.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    let gen = &config.generation;
    match gen.provider.as_str() {
        "disabled" | "openai" | "ollama" | "yandex" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, ollama, or yandex.",
            other
        ),
    }
    if gen.is_enabled() && gen.model.is_none() {
        bail!("generation.model must be specified when provider is '{}'", gen.provider);
    }
    if emb.provider == "yandex" && emb.folder_id.is_none() {
        bail!("embedding.folder_id is required for the yandex provider");
    }
    if gen.provider == "yandex" && gen.folder_id.is_none() {
        bail!("generation.folder_id is required for the yandex provider");
    }

    for pattern in config
        .moderation
        .extra_deny_patterns
        .iter()
        .chain(&config.moderation.extra_allow_patterns)
    {
        regex::Regex::new(pattern)
            .with_context(|| format!("invalid moderation pattern: {}", pattern))?;
    }

    Ok(())
}
