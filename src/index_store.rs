//! On-disk index artifacts and the shared, cached index snapshot.
//!
//! Every committed index lives in its own generation directory, and a
//! `CURRENT` file in the index directory names the live one:
//!
//! ```text
//! index/
//!   CURRENT          "gen-000007"
//!   gen-000006/      previous generation, kept for readers mid-load
//!   gen-000007/
//!     vectors.bin    header + row-major f32 matrix of unit vectors
//!     metadata.json  JSON array of chunks, row-aligned with the matrix
//!     state.json     per-source `{hash, last_modified}` and the last update time
//! ```
//!
//! [`IndexStore::commit`] writes a complete new generation and then renames
//! `CURRENT.tmp` over `CURRENT`. That rename is the only step that changes
//! what readers see, so the matrix, metadata, and state always move
//! together. A failed commit leaves the previous generation live. A missing
//! or unreadable artifact means "rebuild required", never "retry".
//!
//! [`IndexHandle`] is what request handlers hold: it serves an
//! `Arc<VectorIndex>` snapshot from a [`TtlCache`], reloading from disk
//! on a blocking thread when the entry expires, and lets the updater
//! publish a new snapshot. Searches in flight keep whichever snapshot they
//! started with.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use answer_gate_core::embedding::{decode_matrix, encode_matrix};
use answer_gate_core::{DocumentChunk, IndexError, VectorIndex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::TtlCache;

const POINTER_FILE: &str = "CURRENT";
const GENERATION_PREFIX: &str = "gen-";
const VECTORS_FILE: &str = "vectors.bin";
const METADATA_FILE: &str = "metadata.json";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("index artifact not found: {0} (rebuild required)")]
    NotFound(PathBuf),

    #[error("index at {path} is corrupt: {reason} (rebuild required)")]
    Corrupt { path: PathBuf, reason: String },

    #[error("index I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors that a full rebuild resolves.
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Corrupt { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedSource {
    pub hash: String,
    pub last_modified: i64,
}

/// What the updater knows about each indexed source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexState {
    #[serde(default)]
    pub processed_files: BTreeMap<String, ProcessedSource>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

/// File layout of one index directory.
#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pointer_path(&self) -> PathBuf {
        self.dir.join(POINTER_FILE)
    }

    /// The generation directory `CURRENT` points at.
    pub fn current_dir(&self) -> Result<PathBuf, StoreError> {
        let pointer = self.pointer_path();
        let bytes = read_required(&pointer)?;
        let name = String::from_utf8_lossy(&bytes).trim().to_string();
        if parse_generation(&name).is_none() {
            return Err(StoreError::Corrupt {
                path: pointer,
                reason: format!("invalid generation name {:?}", name),
            });
        }
        Ok(self.dir.join(name))
    }

    /// True when `CURRENT` names a generation with every artifact present.
    pub fn exists(&self) -> bool {
        self.current_dir().map_or(false, |gen| {
            [VECTORS_FILE, METADATA_FILE, STATE_FILE]
                .iter()
                .all(|f| gen.join(f).is_file())
        })
    }

    pub fn load_index(&self) -> Result<VectorIndex, StoreError> {
        load_index_from(&self.current_dir()?)
    }

    pub fn load_state(&self) -> Result<IndexState, StoreError> {
        load_state_from(&self.current_dir()?)
    }

    /// Index and state of the same generation.
    pub fn load(&self) -> Result<(VectorIndex, IndexState), StoreError> {
        let gen = self.current_dir()?;
        Ok((load_index_from(&gen)?, load_state_from(&gen)?))
    }

    /// Write `index` and `state` as a new generation and make it live.
    ///
    /// Generations older than the one being replaced are removed afterwards;
    /// failing to remove them is only logged.
    pub fn commit(&self, index: &VectorIndex, state: &IndexState) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let generations = self.generations()?;
        let next = generations.iter().map(|(n, _)| n + 1).max().unwrap_or(1);
        let name = generation_name(next);
        let gen = self.dir.join(&name);

        std::fs::create_dir(&gen)?;
        let dims = index.dims().unwrap_or(0);
        let matrix =
            encode_matrix(index.len(), dims, index.matrix()).map_err(|e| corrupt(&gen, e))?;
        write_synced(&gen.join(VECTORS_FILE), &matrix)?;
        write_synced(&gen.join(METADATA_FILE), &serde_json::to_vec(index.chunks())?)?;
        write_synced(&gen.join(STATE_FILE), &serde_json::to_vec_pretty(state)?)?;

        let previous = self.current_dir().ok();
        write_atomic(&self.pointer_path(), name.as_bytes())?;
        debug!(generation = %name, rows = index.len(), "committed index");

        for (_, path) in generations {
            if Some(&path) == previous.as_ref() {
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "could not remove old index generation");
            }
        }
        Ok(gen)
    }

    /// Remove all artifacts, forcing the next update to rebuild.
    pub fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(self.pointer_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for (_, path) in self.generations()? {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn generations(&self) -> Result<Vec<(u64, PathBuf)>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(n) = entry.file_name().to_str().and_then(parse_generation) {
                found.push((n, entry.path()));
            }
        }
        Ok(found)
    }
}

fn generation_name(n: u64) -> String {
    format!("{}{:06}", GENERATION_PREFIX, n)
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(GENERATION_PREFIX)?.parse().ok()
}

fn load_index_from(gen: &Path) -> Result<VectorIndex, StoreError> {
    let vectors_path = gen.join(VECTORS_FILE);
    let metadata_path = gen.join(METADATA_FILE);
    let vector_bytes = read_required(&vectors_path)?;
    let metadata_bytes = read_required(&metadata_path)?;

    let (rows, dims, matrix) =
        decode_matrix(&vector_bytes).map_err(|e| corrupt(&vectors_path, e))?;
    let chunks: Vec<DocumentChunk> =
        serde_json::from_slice(&metadata_bytes).map_err(|e| StoreError::Corrupt {
            path: metadata_path.clone(),
            reason: e.to_string(),
        })?;
    if chunks.len() != rows {
        return Err(StoreError::Corrupt {
            path: gen.to_path_buf(),
            reason: format!("{} metadata rows but {} vectors", chunks.len(), rows),
        });
    }

    let index = VectorIndex::from_parts(chunks, matrix, dims).map_err(|e| corrupt(gen, e))?;
    debug!(rows, dims, dir = %gen.display(), "loaded index");
    Ok(index)
}

fn load_state_from(gen: &Path) -> Result<IndexState, StoreError> {
    let path = gen.join(STATE_FILE);
    let bytes = read_required(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path,
        reason: e.to_string(),
    })
}

fn corrupt(path: &Path, err: IndexError) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn read_required(path: &Path) -> Result<Vec<u8>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StoreError::NotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    write_synced(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Run blocking store I/O off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

// ============ Shared snapshot ============

/// Shared access to the current index snapshot.
///
/// `epoch` counts publications. A reload that started before a
/// [`replace`](IndexHandle::replace) or [`invalidate`](IndexHandle::invalidate)
/// is returned to its caller but never cached.
pub struct IndexHandle {
    store: IndexStore,
    cache: TtlCache<Arc<VectorIndex>>,
    epoch: Mutex<u64>,
}

impl IndexHandle {
    pub fn new(store: IndexStore, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl),
            epoch: Mutex::new(0),
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// The current snapshot, loading it from disk when the cache is cold.
    pub async fn snapshot(&self) -> Result<Arc<VectorIndex>, StoreError> {
        if let Some(index) = self.cache.get() {
            return Ok(index);
        }
        let epoch = self.epoch();
        let store = self.store.clone();
        let index = blocking(move || store.load_index()).await?;
        Ok(self.publish_loaded(epoch, Arc::new(index)))
    }

    /// Index and state of the live generation, read from disk.
    pub async fn load_committed(&self) -> Result<(VectorIndex, IndexState), StoreError> {
        let store = self.store.clone();
        blocking(move || store.load()).await
    }

    /// Persist `index` and `state` as the live generation, then publish it.
    pub async fn commit(
        &self,
        index: VectorIndex,
        state: IndexState,
    ) -> Result<Arc<VectorIndex>, StoreError> {
        let store = self.store.clone();
        let index = blocking(move || store.commit(&index, &state).map(|_| index)).await?;
        Ok(self.replace(index))
    }

    /// Publish a new snapshot. The caller persists it first.
    pub fn replace(&self, index: VectorIndex) -> Arc<VectorIndex> {
        let index = Arc::new(index);
        let mut epoch = self.epoch.lock().unwrap_or_else(|p| p.into_inner());
        *epoch += 1;
        self.cache.put(Arc::clone(&index));
        index
    }

    pub fn invalidate(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(|p| p.into_inner());
        *epoch += 1;
        self.cache.invalidate();
    }

    fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cache a snapshot loaded at `epoch` unless something newer was
    /// published meanwhile, in which case the newer one is returned.
    fn publish_loaded(&self, epoch: u64, index: Arc<VectorIndex>) -> Arc<VectorIndex> {
        let current = self.epoch.lock().unwrap_or_else(|p| p.into_inner());
        if *current == epoch {
            self.cache.put(Arc::clone(&index));
            return index;
        }
        debug!("discarding snapshot loaded before a newer publication");
        self.cache.get().unwrap_or(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use answer_gate_core::IndexEntry;
    use tempfile::TempDir;

    fn chunk(id: &str, source: &str) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            source_key: source.to_string(),
            chunk_index: 0,
            text: format!("text {}", id),
            content_hash: "h".to_string(),
            last_modified: 1,
            metadata: serde_json::json!({ "file_type": "txt" }),
        }
    }

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new();
        index
            .add(vec![
                IndexEntry { chunk: chunk("a", "one.txt"), vector: vec![1.0, 0.0] },
                IndexEntry { chunk: chunk("b", "two.txt"), vector: vec![0.0, 2.0] },
            ])
            .unwrap();
        index
    }

    fn state_with(key: &str) -> IndexState {
        let mut state = IndexState::default();
        state.processed_files.insert(
            key.into(),
            ProcessedSource { hash: "abc".into(), last_modified: 5 },
        );
        state
    }

    fn generation_dirs(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(GENERATION_PREFIX))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_missing_artifacts_are_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::new(tmp.path().join("idx"));
        assert!(!store.exists());
        let err = store.load_index().unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(err.requires_rebuild());
        assert!(matches!(store.load_state(), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_commit_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::new(tmp.path());
        let state = state_with("one.txt");
        let gen = store.commit(&sample_index(), &state).unwrap();

        assert!(store.exists());
        assert_eq!(store.current_dir().unwrap(), gen);
        let (loaded, loaded_state) = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dims(), Some(2));
        assert_eq!(loaded.search(&[0.0, 1.0], 1)[0].chunk.id, "b");
        assert_eq!(loaded_state, state);
        assert!(!tmp.path().join("CURRENT.tmp").exists());
    }

    #[test]
    fn test_commit_keeps_only_live_and_previous_generation() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::new(tmp.path());
        for _ in 0..4 {
            store.commit(&sample_index(), &IndexState::default()).unwrap();
        }
        assert_eq!(generation_dirs(tmp.path()), vec!["gen-000003", "gen-000004"]);
        assert!(store.current_dir().unwrap().ends_with("gen-000004"));
    }

    #[test]
    fn test_failed_pointer_switch_keeps_previous_generation_live() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::new(tmp.path());
        store.commit(&sample_index(), &state_with("one.txt")).unwrap();

        std::fs::create_dir(tmp.path().join("CURRENT.tmp")).unwrap();
        let err = store.commit(&VectorIndex::new(), &state_with("two.txt")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let (index, state) = store.load().unwrap();
        assert_eq!(index.len(), 2);
        assert!(state.processed_files.contains_key("one.txt"));
        assert!(!state.processed_files.contains_key("two.txt"));

        // The abandoned generation is cleaned up by the next commit.
        std::fs::remove_dir(tmp.path().join("CURRENT.tmp")).unwrap();
        store.commit(&sample_index(), &state_with("three.txt")).unwrap();
        assert_eq!(generation_dirs(tmp.path()), vec!["gen-000001", "gen-000003"]);
    }

    #[test]
    fn test_row_mismatch_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::new(tmp.path());
        let gen = store.commit(&sample_index(), &IndexState::default()).unwrap();
        std::fs::write(gen.join(METADATA_FILE), b"[]").unwrap();
        let err = store.load_index().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.requires_rebuild());
    }

    #[test]
    fn test_bad_pointer_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(POINTER_FILE), b"../elsewhere").unwrap();
        let err = IndexStore::new(tmp.path()).load_index().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_clear_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::new(tmp.path());
        store.commit(&sample_index(), &IndexState::default()).unwrap();
        store.commit(&sample_index(), &IndexState::default()).unwrap();
        store.clear().unwrap();
        assert!(!store.exists());
        assert!(generation_dirs(tmp.path()).is_empty());
        store.clear().unwrap();
    }

    #[tokio::test]
    async fn test_handle_serves_replaced_snapshot() {
        let tmp = TempDir::new().unwrap();
        let handle = IndexHandle::new(IndexStore::new(tmp.path()), Duration::from_secs(60));
        assert!(handle.snapshot().await.is_err());

        let old = handle.replace(sample_index());
        let mut bigger = (*old).clone();
        bigger
            .add(vec![IndexEntry { chunk: chunk("c", "three.txt"), vector: vec![1.0, 1.0] }])
            .unwrap();
        handle.replace(bigger);

        assert_eq!(old.len(), 2);
        assert_eq!(handle.snapshot().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_handle_reloads_after_invalidate() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::new(tmp.path());
        store.commit(&sample_index(), &IndexState::default()).unwrap();
        let handle = IndexHandle::new(store, Duration::from_secs(60));
        handle.replace(VectorIndex::new());
        assert_eq!(handle.snapshot().await.unwrap().len(), 0);
        handle.invalidate();
        assert_eq!(handle.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_persists_and_publishes() {
        let tmp = TempDir::new().unwrap();
        let handle = IndexHandle::new(IndexStore::new(tmp.path()), Duration::from_secs(60));
        let published = handle.commit(sample_index(), state_with("one.txt")).await.unwrap();
        assert_eq!(published.len(), 2);
        assert!(Arc::ptr_eq(&handle.snapshot().await.unwrap(), &published));

        let (index, state) = handle.load_committed().await.unwrap();
        assert_eq!(index.len(), 2);
        assert!(state.processed_files.contains_key("one.txt"));
    }

    #[test]
    fn test_reload_started_before_replace_is_not_cached() {
        let tmp = TempDir::new().unwrap();
        let handle = IndexHandle::new(IndexStore::new(tmp.path()), Duration::from_secs(60));

        // A reader notes the epoch and starts reading the old files...
        let epoch = handle.epoch();
        let stale = Arc::new(VectorIndex::new());
        // ...while the updater publishes a newer index.
        let fresh = handle.replace(sample_index());

        let served = handle.publish_loaded(epoch, stale);
        assert!(Arc::ptr_eq(&served, &fresh));
        assert_eq!(handle.cache.get().map(|i| i.len()), Some(2));
    }

    #[test]
    fn test_reload_without_interference_is_cached() {
        let tmp = TempDir::new().unwrap();
        let handle = IndexHandle::new(IndexStore::new(tmp.path()), Duration::from_secs(60));
        let epoch = handle.epoch();
        let loaded = handle.publish_loaded(epoch, Arc::new(sample_index()));
        assert!(Arc::ptr_eq(&handle.cache.get().unwrap(), &loaded));
    }
}
