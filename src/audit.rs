//! Append-only audit trail of request outcomes.
//!
//! One JSON object per line:
//!
//! ```json
//! {"ts":"2024-05-01T10:00:00Z","identity":"u42","action":"answered","query":"margarita recipe","meta":{...}}
//! ```
//!
//! Each record is written with a single `write_all` while holding the
//! sink's lock, so lines never interleave within one process.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RateLimited,
    BlockedPre,
    BlockedPost,
    Answered,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub identity: String,
    pub action: AuditAction,
    pub query: String,
    #[serde(default)]
    pub meta: Value,
}

impl AuditRecord {
    pub fn new(identity: &str, action: AuditAction, query: &str, meta: Value) -> Self {
        Self {
            ts: Utc::now(),
            identity: identity.to_string(),
            action,
            query: query.to_string(),
            meta,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// JSON Lines file opened in append mode.
pub struct JsonlAuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory sink for tests and embedding callers.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: std::sync::Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
        Ok(())
    }
}

/// Read every record of a JSON Lines audit file.
pub fn read_jsonl(path: &Path) -> Result<Vec<AuditRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("invalid audit record"))
        .collect()
}
