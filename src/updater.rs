//! Incremental and full index maintenance.
//!
//! # Incremental run
//!
//! ```text
//! Idle ─► Scanning ─► Processing{done,total} ─► Merging ─► Done
//!            │                │                     │
//!            └────────────────┴─────────────────────┴──► Failed
//! ```
//!
//! 1. **Scanning** loads the committed index and state from disk, then
//!    lists the source. A listing is *changed* when its key is not in
//!    `processed_files` or its `last_modified` differs.
//! 2. **Processing** fetches, extracts, chunks, and embeds each changed
//!    source. A failure in one source is logged and that source is
//!    skipped; it stays out of the state and is retried next run.
//! 3. **Merging** commits the index and state together as one new
//!    generation, then publishes the snapshot to the shared [`IndexHandle`].
//!    A failed commit leaves the previous generation, and its state, live.
//!
//! A missing or unreadable index or state returns
//! [`UpdateOutcome::RebuildRequired`] instead of an error.
//!
//! Entries of deleted sources stay in the index, and a changed source's
//! new chunks are appended next to its old ones. There is no tombstoning.

use std::sync::Arc;
use std::time::Duration;

use answer_gate_core::chunk::{chunk_text, sha256_hex};
use answer_gate_core::{IndexEntry, VectorIndex};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::backend::{with_timeout, Embedder};
use crate::cancel::CancellationFlag;
use crate::config::Config;
use crate::extract::{file_type, TextExtractor};
use crate::index_store::{IndexHandle, IndexState, ProcessedSource};
use crate::sources::{DocumentSource, SourceListing};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Scanning,
    Processing { done: usize, total: usize },
    Merging,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub listed: usize,
    pub changed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub chunks_added: usize,
    pub embed_calls: usize,
    pub total_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Changed sources were merged and persisted.
    Updated(UpdateReport),
    /// Nothing was persisted: no changes, or every changed source failed.
    Unchanged(UpdateReport),
    /// No usable index or state on disk. Run [`IndexUpdater::rebuild`].
    RebuildRequired,
}

impl UpdateOutcome {
    pub fn is_rebuild_required(&self) -> bool {
        matches!(self, UpdateOutcome::RebuildRequired)
    }
}

pub struct IndexUpdater {
    source: Arc<dyn DocumentSource>,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn Embedder>,
    index: Arc<IndexHandle>,
    max_chars: usize,
    batch_size: usize,
    fetch_timeout: Duration,
    embed_timeout: Duration,
    run_lock: Mutex<()>,
    phase: watch::Sender<UpdatePhase>,
}

impl IndexUpdater {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        index: Arc<IndexHandle>,
        config: &Config,
    ) -> Self {
        let (phase, _) = watch::channel(UpdatePhase::Idle);
        Self {
            source,
            extractor,
            embedder,
            index,
            max_chars: config.chunking.max_chars,
            batch_size: config.embedding.batch_size.max(1),
            fetch_timeout: Duration::from_secs(config.source.fetch_timeout_secs),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            run_lock: Mutex::new(()),
            phase,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdatePhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase.borrow().clone()
    }

    fn set_phase(&self, phase: UpdatePhase) {
        self.phase.send_replace(phase);
    }

    /// `true` on incremental success (including a no-op), `false` when a
    /// full rebuild is required.
    pub async fn update(&self) -> Result<bool> {
        let outcome = self.run_incremental(&CancellationFlag::new()).await?;
        Ok(!outcome.is_rebuild_required())
    }

    pub async fn run_incremental(&self, cancel: &CancellationFlag) -> Result<UpdateOutcome> {
        let _guard = self.run_lock.lock().await;
        let result = self.incremental(cancel).await;
        match &result {
            Ok(UpdateOutcome::RebuildRequired) => self.set_phase(UpdatePhase::Idle),
            Ok(_) => self.set_phase(UpdatePhase::Done),
            Err(e) => {
                warn!(error = %e, "index update failed");
                self.set_phase(UpdatePhase::Failed);
            }
        }
        result
    }

    /// Process every listed source into a fresh index and replace the old
    /// index and state.
    pub async fn rebuild(&self, cancel: &CancellationFlag) -> Result<UpdateReport> {
        let _guard = self.run_lock.lock().await;
        let result = self.full_rebuild(cancel).await;
        match &result {
            Ok(_) => self.set_phase(UpdatePhase::Done),
            Err(e) => {
                warn!(error = %e, "index rebuild failed");
                self.set_phase(UpdatePhase::Failed);
            }
        }
        result
    }

    async fn incremental(&self, cancel: &CancellationFlag) -> Result<UpdateOutcome> {
        self.set_phase(UpdatePhase::Scanning);
        // The base is the committed generation, never the TTL-cached snapshot.
        let (current, mut state) = match self.index.load_committed().await {
            Ok(loaded) => loaded,
            Err(e) if e.requires_rebuild() => {
                info!(reason = %e, "no usable index, full rebuild required");
                return Ok(UpdateOutcome::RebuildRequired);
            }
            Err(e) => return Err(e.into()),
        };

        let listings = self.list().await?;
        let changed: Vec<SourceListing> = listings
            .iter()
            .filter(|l| {
                state
                    .processed_files
                    .get(&l.key)
                    .map_or(true, |p| p.last_modified != l.last_modified)
            })
            .cloned()
            .collect();

        let mut report = UpdateReport {
            listed: listings.len(),
            changed: changed.len(),
            ..UpdateReport::default()
        };
        debug!(listed = report.listed, changed = report.changed, "scanned sources");

        if changed.is_empty() {
            report.total_entries = current.len();
            info!(entries = report.total_entries, "index is up to date");
            return Ok(UpdateOutcome::Unchanged(report));
        }

        let base_len = current.len();
        let mut working = current;
        self.process(&changed, &mut working, &mut state, &mut report, cancel)
            .await?;

        if report.processed == 0 {
            report.total_entries = base_len;
            warn!(skipped = report.skipped, "no changed source could be processed");
            return Ok(UpdateOutcome::Unchanged(report));
        }

        cancel.check()?;
        report.total_entries = working.len();
        self.merge(working, state).await?;
        info!(
            processed = report.processed,
            skipped = report.skipped,
            chunks = report.chunks_added,
            entries = report.total_entries,
            "index updated"
        );
        Ok(UpdateOutcome::Updated(report))
    }

    async fn full_rebuild(&self, cancel: &CancellationFlag) -> Result<UpdateReport> {
        self.set_phase(UpdatePhase::Scanning);
        let listings = self.list().await?;
        let mut report = UpdateReport {
            listed: listings.len(),
            changed: listings.len(),
            ..UpdateReport::default()
        };

        let mut index = VectorIndex::new();
        let mut state = IndexState::default();
        self.process(&listings, &mut index, &mut state, &mut report, cancel)
            .await?;

        cancel.check()?;
        report.total_entries = index.len();
        self.merge(index, state).await?;
        info!(
            processed = report.processed,
            skipped = report.skipped,
            entries = report.total_entries,
            "index rebuilt"
        );
        Ok(report)
    }

    async fn list(&self) -> Result<Vec<SourceListing>> {
        match tokio::time::timeout(self.fetch_timeout, self.source.list()).await {
            Ok(listings) => listings,
            Err(_) => bail!(
                "listing {} source timed out after {:?}",
                self.source.name(),
                self.fetch_timeout
            ),
        }
    }

    async fn process(
        &self,
        listings: &[SourceListing],
        index: &mut VectorIndex,
        state: &mut IndexState,
        report: &mut UpdateReport,
        cancel: &CancellationFlag,
    ) -> Result<()> {
        let total = listings.len();
        self.set_phase(UpdatePhase::Processing { done: 0, total });

        for (i, listing) in listings.iter().enumerate() {
            cancel.check()?;
            match self.process_source(listing, report).await {
                // `add` is all-or-nothing, so a rejected source leaves the index as it was.
                Ok((entries, hash)) => match index.add(entries) {
                    Ok(added) => {
                        report.processed += 1;
                        report.chunks_added += added;
                        state.processed_files.insert(
                            listing.key.clone(),
                            ProcessedSource {
                                hash,
                                last_modified: listing.last_modified,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(key = %listing.key, error = %e, "skipping source");
                        report.skipped += 1;
                    }
                },
                Err(e) => {
                    warn!(key = %listing.key, error = %e, "skipping source");
                    report.skipped += 1;
                }
            }
            self.set_phase(UpdatePhase::Processing { done: i + 1, total });
        }
        Ok(())
    }

    /// Fetch, extract, chunk, and embed one source.
    async fn process_source(
        &self,
        listing: &SourceListing,
        report: &mut UpdateReport,
    ) -> Result<(Vec<IndexEntry>, String)> {
        let key = listing.key.as_str();
        let bytes = tokio::time::timeout(self.fetch_timeout, self.source.fetch(key))
            .await
            .map_err(|_| anyhow!("fetch timed out after {:?}", self.fetch_timeout))??;
        let hash = sha256_hex(&bytes);

        let text = self.extractor.extract_text(&bytes, key)?;
        if text.trim().is_empty() {
            bail!("no text extracted");
        }

        let mut chunks = chunk_text(key, listing.last_modified, &text, self.max_chars);
        let kind = file_type(key);
        for chunk in &mut chunks {
            if let Value::Object(meta) = &mut chunk.metadata {
                meta.insert("file_type".to_string(), Value::String(kind.clone()));
            }
        }

        let mut entries = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            report.embed_calls += 1;
            let vectors = with_timeout(self.embed_timeout, self.embedder.embed(&texts)).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedding backend returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }
            entries.extend(
                batch
                    .iter()
                    .cloned()
                    .zip(vectors)
                    .map(|(chunk, vector)| IndexEntry { chunk, vector }),
            );
        }

        debug!(key, chunks = entries.len(), "processed source");
        Ok((entries, hash))
    }

    async fn merge(&self, index: VectorIndex, mut state: IndexState) -> Result<()> {
        self.set_phase(UpdatePhase::Merging);
        state.last_update = Some(Utc::now());
        self.index.commit(index, state).await?;
        Ok(())
    }
}
