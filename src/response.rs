//! Text extraction from schema-less generation responses.
//!
//! Providers disagree on where the completion text lives, and some change
//! shape between API versions. Callers depend only on [`ResponseAdapter`];
//! [`NestedTextAdapter`] tries the known layouts first and then falls back
//! to a depth-first search for the first string that is not a role label
//! or bookkeeping field.
//!
//! | Provider | Path |
//! |----------|------|
//! | Yandex | `result.alternatives[0].message.text` |
//! | OpenAI | `choices[0].message.content` |
//! | Ollama chat | `message.content` |
//! | Ollama generate | `response` |

use serde_json::Value;

/// Pull the answer text out of a raw backend response.
pub trait ResponseAdapter: Send + Sync {
    /// `None` when no usable, non-empty text is present.
    fn extract_text(&self, response: &Value) -> Option<String>;
}

const KNOWN_PATHS: &[&[PathStep]] = &[
    &[Key("result"), Key("alternatives"), Idx(0), Key("message"), Key("text")],
    &[Key("alternatives"), Idx(0), Key("message"), Key("text")],
    &[Key("choices"), Idx(0), Key("message"), Key("content")],
    &[Key("choices"), Idx(0), Key("message"), Key("text")],
    &[Key("choices"), Idx(0), Key("text")],
    &[Key("message"), Key("content")],
    &[Key("response")],
    &[Key("text")],
];

const ROLE_LABELS: &[&str] = &["assistant", "user", "system"];

/// Keys whose string values are never answer text.
const SKIPPED_KEYS: &[&str] = &[
    "role",
    "id",
    "model",
    "modelVersion",
    "object",
    "status",
    "finish_reason",
    "done_reason",
    "created_at",
];

#[derive(Clone, Copy)]
enum PathStep {
    Key(&'static str),
    Idx(usize),
}
use PathStep::{Idx, Key};

/// Default adapter: known layouts, then a recursive role-skipping search.
#[derive(Debug, Clone)]
pub struct NestedTextAdapter {
    max_chars: usize,
}

impl NestedTextAdapter {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for NestedTextAdapter {
    fn default() -> Self {
        Self::new(4000)
    }
}

impl ResponseAdapter for NestedTextAdapter {
    fn extract_text(&self, response: &Value) -> Option<String> {
        let text = match response {
            Value::String(s) => usable(s),
            _ => KNOWN_PATHS
                .iter()
                .find_map(|path| follow(response, path).and_then(Value::as_str).and_then(usable))
                .or_else(|| first_text(response)),
        }?;
        Some(text.chars().take(self.max_chars).collect())
    }
}

fn follow<'a>(value: &'a Value, path: &[PathStep]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, step| match step {
        Key(k) => current.get(*k),
        Idx(i) => current.get(*i),
    })
}

fn usable(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() || ROLE_LABELS.contains(&trimmed.to_lowercase().as_str()) {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => usable(s),
        Value::Array(items) => items.iter().find_map(first_text),
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !SKIPPED_KEYS.contains(&k.as_str()))
            .find_map(|(_, v)| first_text(v)),
        _ => None,
    }
}
