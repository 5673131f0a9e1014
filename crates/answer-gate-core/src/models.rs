//! Data types that flow between the index updater, the vector index,
//! and the retriever.

use serde::{Deserialize, Serialize};

/// A piece of a source document's text, the unit of retrieval.
///
/// Chunks are immutable once created. `content_hash` is the SHA-256 of
/// `text`; `last_modified` is the source's modification time in
/// milliseconds since the Unix epoch at the moment it was indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub source_key: String,
    pub chunk_index: usize,
    pub text: String,
    pub content_hash: String,
    pub last_modified: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A chunk paired with its embedding, as handed to [`crate::VectorIndex::add`].
///
/// The vector does not need to be normalized; the index normalizes on insert.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: DocumentChunk,
    pub vector: Vec<f32>,
}

/// One search result: the matching chunk and its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: DocumentChunk,
    pub score: f32,
    /// Row of the hit in insertion order.
    pub row: usize,
}
