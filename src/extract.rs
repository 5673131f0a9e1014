//! Plain-text extraction for source documents.
//!
//! The format is chosen from the filename extension. Extraction never
//! panics: unsupported or malformed input returns an [`ExtractError`] and
//! the updater skips that source.
//!
//! | Extension | Handling |
//! |-----------|----------|
//! | `txt`, `md` | UTF-8 (lossy) |
//! | `csv` | raw text, one record per line |
//! | `json` | flattened to `key: value` lines; top-level array items become paragraphs |
//! | `pdf` | `pdf-extract` |

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8], filename_hint: &str) -> Result<String, ExtractError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExtractor;

impl TextExtractor for DefaultExtractor {
    fn extract_text(&self, bytes: &[u8], filename_hint: &str) -> Result<String, ExtractError> {
        match file_type(filename_hint).as_str() {
            "txt" | "md" | "csv" => Ok(String::from_utf8_lossy(bytes).into_owned()),
            "json" => extract_json(bytes),
            "pdf" => extract_pdf(bytes),
            other => Err(ExtractError::Unsupported(other.to_string())),
        }
    }
}

/// Lowercased extension of `name`, or an empty string.
pub fn file_type(name: &str) -> String {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_json(bytes: &[u8]) -> Result<String, ExtractError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let text = match &value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let mut lines = Vec::new();
                flatten(item, "", &mut lines);
                lines.join("\n")
            })
            .filter(|block| !block.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        other => {
            let mut lines = Vec::new();
            flatten(other, "", &mut lines);
            lines.join("\n")
        }
    };
    Ok(text)
}

fn flatten(value: &Value, path: &str, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                flatten(child, &child_path, out);
            }
        }
        Value::Array(items) if items.iter().all(|v| !v.is_object() && !v.is_array()) => {
            let joined = items
                .iter()
                .filter_map(scalar)
                .collect::<Vec<_>>()
                .join(", ");
            if !joined.is_empty() {
                out.push(labelled(path, &joined));
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten(item, path, out);
            }
        }
        other => {
            if let Some(text) = scalar(other) {
                out.push(labelled(path, &text));
            }
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn labelled(path: &str, text: &str) -> String {
    if path.is_empty() {
        text.to_string()
    } else {
        format!("{}: {}", path, text)
    }
}
