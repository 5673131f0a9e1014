//! Query-time retrieval over the shared index snapshot.
//!
//! Retrieval never fails the request: an empty query, an embedding error
//! or timeout, a missing index, or a dimension disagreement all produce an
//! empty [`RetrievedContext`] and a log line.

use std::sync::Arc;
use std::time::Duration;

use answer_gate_core::SearchHit;
use tracing::{debug, warn};

use crate::backend::{with_timeout, Embedder};
use crate::config::RetrievalConfig;
use crate::index_store::IndexHandle;

/// Search hits plus the threshold that separates strong from weak context.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub hits: Vec<SearchHit>,
    pub threshold: f32,
}

impl RetrievedContext {
    pub fn empty(threshold: f32) -> Self {
        Self {
            hits: Vec::new(),
            threshold,
        }
    }

    /// Hits scoring at or above the relevance threshold.
    pub fn strong_hits(&self) -> impl Iterator<Item = &SearchHit> {
        self.hits.iter().filter(move |h| h.score >= self.threshold)
    }

    pub fn has_strong(&self) -> bool {
        self.strong_hits().next().is_some()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<IndexHandle>,
    threshold: f32,
    dedupe_by_source: bool,
    timeout: Duration,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<IndexHandle>,
        config: &RetrievalConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            threshold: config.relevance_threshold,
            dedupe_by_source: config.dedupe_by_source,
            timeout,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> RetrievedContext {
        if query.trim().is_empty() || k == 0 {
            return RetrievedContext::empty(self.threshold);
        }

        let vector = match with_timeout(self.timeout, self.embedder.embed_query(query)).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => {
                warn!("query embedding was empty");
                return RetrievedContext::empty(self.threshold);
            }
            Err(e) => {
                warn!(error = %e, "query embedding failed, continuing without context");
                return RetrievedContext::empty(self.threshold);
            }
        };

        let index = match self.index.snapshot().await {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "index unavailable, continuing without context");
                return RetrievedContext::empty(self.threshold);
            }
        };

        if let Some(dims) = index.dims() {
            if dims != vector.len() {
                warn!(
                    index_dims = dims,
                    query_dims = vector.len(),
                    "query embedding dimension does not match the index"
                );
                return RetrievedContext::empty(self.threshold);
            }
        }

        let hits = if self.dedupe_by_source {
            best_per_source(index.search(&vector, k.saturating_mul(4)), k)
        } else {
            index.search(&vector, k)
        };

        debug!(
            count = hits.len(),
            top_score = hits.first().map(|h| h.score).unwrap_or(0.0),
            "retrieved context"
        );
        RetrievedContext {
            hits,
            threshold: self.threshold,
        }
    }
}

/// Keep the first (best-scoring) hit of each source, up to `k`.
fn best_per_source(hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    let mut seen = std::collections::HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.chunk.source_key.clone()))
        .take(k)
        .collect()
}
