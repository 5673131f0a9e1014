//! Exact brute-force vector index.
//!
//! [`VectorIndex`] keeps chunks and their unit-normalized vectors in
//! insertion order. Search scores every row against the query (O(N·D))
//! and returns the best `k` by descending cosine similarity, ties broken
//! by insertion order.
//!
//! The index is a plain value. Concurrent readers share it behind an
//! `Arc`; writers clone it, [`add`](VectorIndex::add) to the clone, and
//! swap the new snapshot in.
//!
//! ```rust
//! use answer_gate_core::{DocumentChunk, IndexEntry, VectorIndex};
//!
//! let chunk = DocumentChunk {
//!     id: "c1".into(),
//!     source_key: "a.txt".into(),
//!     chunk_index: 0,
//!     text: "hello".into(),
//!     content_hash: String::new(),
//!     last_modified: 0,
//!     metadata: serde_json::Value::Null,
//! };
//! let mut index = VectorIndex::new();
//! index.add(vec![IndexEntry { chunk, vector: vec![3.0, 4.0] }]).unwrap();
//! let hits = index.search(&[3.0, 4.0], 5);
//! assert!((hits[0].score - 1.0).abs() < 1e-6);
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use crate::embedding::{dot, normalize};
use crate::error::IndexError;
use crate::models::{DocumentChunk, IndexEntry, SearchHit};

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    /// Fixed by the first successful `add`, or by [`VectorIndex::from_parts`].
    dims: Option<usize>,
    chunks: Vec<DocumentChunk>,
    /// Row-major, `chunks.len() × dims`.
    vectors: Vec<f32>,
    ids: HashSet<String>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from persisted rows.
    ///
    /// `matrix` must hold `chunks.len() × dims` values that were already
    /// normalized when they were first added.
    pub fn from_parts(
        chunks: Vec<DocumentChunk>,
        matrix: Vec<f32>,
        dims: usize,
    ) -> Result<Self, IndexError> {
        if chunks.len() * dims != matrix.len() {
            return Err(IndexError::Corrupt(format!(
                "{} metadata rows do not match a matrix of {} values at {} dims",
                chunks.len(),
                matrix.len(),
                dims
            )));
        }
        let mut ids = HashSet::with_capacity(chunks.len());
        for c in &chunks {
            if !ids.insert(c.id.clone()) {
                return Err(IndexError::DuplicateChunkId(c.id.clone()));
            }
        }
        Ok(Self {
            dims: if chunks.is_empty() { None } else { Some(dims) },
            chunks,
            vectors: matrix,
            ids,
        })
    }

    /// Append entries, all or nothing.
    ///
    /// Every vector must have the index's dimension (or, for an empty
    /// index, the dimension of the first entry). On any error the index
    /// is left unchanged. Returns the number of rows added.
    pub fn add(&mut self, entries: Vec<IndexEntry>) -> Result<usize, IndexError> {
        let Some(first) = entries.first() else {
            return Ok(0);
        };
        let dims = self.dims.unwrap_or(first.vector.len());

        let mut staged_ids = HashSet::with_capacity(entries.len());
        let mut staged_vectors = Vec::with_capacity(entries.len() * dims);
        for entry in &entries {
            if entry.vector.len() != dims {
                return Err(IndexError::DimensionMismatch {
                    expected: dims,
                    actual: entry.vector.len(),
                    chunk_id: entry.chunk.id.clone(),
                });
            }
            if self.ids.contains(&entry.chunk.id) || !staged_ids.insert(entry.chunk.id.as_str()) {
                return Err(IndexError::DuplicateChunkId(entry.chunk.id.clone()));
            }
            let unit = normalize(&entry.vector)
                .ok_or_else(|| IndexError::ZeroVector(entry.chunk.id.clone()))?;
            staged_vectors.extend_from_slice(&unit);
        }

        let added = entries.len();
        self.dims = Some(dims);
        self.vectors.extend(staged_vectors);
        for entry in entries {
            self.ids.insert(entry.chunk.id.clone());
            self.chunks.push(entry.chunk);
        }
        Ok(added)
    }

    /// Return up to `k` hits sorted by descending similarity.
    ///
    /// An empty index, `k == 0`, a zero query, or a query whose length
    /// differs from the index dimension all yield an empty result.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        let Some(dims) = self.dims else {
            return Vec::new();
        };
        if k == 0 || query.len() != dims {
            return Vec::new();
        }
        let Some(q) = normalize(query) else {
            return Vec::new();
        };

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .chunks_exact(dims)
            .enumerate()
            .map(|(row, v)| (row, dot(v, &q)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(row, score)| SearchHit {
                chunk: self.chunks[row].clone(),
                score,
                row,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn chunks(&self) -> &[DocumentChunk] {
        &self.chunks
    }

    /// Chunks paired with their normalized vectors, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&DocumentChunk, &[f32])> + '_ {
        let dims = self.dims.unwrap_or(0).max(1);
        self.chunks.iter().zip(self.vectors.chunks(dims))
    }

    /// The normalized row-major matrix backing the index.
    pub fn matrix(&self) -> &[f32] {
        &self.vectors
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.ids.contains(chunk_id)
    }

    /// Distinct source keys present in the index.
    pub fn source_keys(&self) -> BTreeSet<&str> {
        self.chunks.iter().map(|c| c.source_key.as_str()).collect()
    }
}
