//! Index maintenance against a real directory and an on-disk index.

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use answer_gate::cancel::CancellationFlag;
use answer_gate::index_store::IndexStore;
use answer_gate::updater::UpdateOutcome;
use common::{config, handle, updater, write_doc, KeywordEmbedder};
use tempfile::TempDir;

fn touch(path: &std::path::Path, secs_after_epoch: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
        .unwrap();
}

fn seed(docs: &TempDir) {
    write_doc(docs.path(), "recipes/margarita.txt", "Classic Margarita: tequila, lime juice, triple sec");
    write_doc(docs.path(), "recipes/mojito.txt", "Mojito: white rum, mint, lime, soda");
}

#[tokio::test]
async fn test_unchanged_sources_make_no_embedding_calls() {
    let docs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    seed(&docs);
    let cfg = config(docs.path(), data.path());
    let embedder = Arc::new(KeywordEmbedder::default());
    let updater = updater(&cfg, embedder.clone(), handle(&cfg));

    updater.rebuild(&CancellationFlag::new()).await.unwrap();
    assert!(embedder.calls() > 0);
    embedder.reset();

    assert!(updater.update().await.unwrap());
    assert!(updater.update().await.unwrap());
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn test_missing_index_requires_rebuild() {
    let docs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    seed(&docs);
    let cfg = config(docs.path(), &data.path().join("never-built"));
    let embedder = Arc::new(KeywordEmbedder::default());
    let updater = updater(&cfg, embedder.clone(), handle(&cfg));

    assert!(!updater.update().await.unwrap());
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn test_corrupt_index_requires_rebuild() {
    let docs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    seed(&docs);
    let cfg = config(docs.path(), data.path());
    let embedder = Arc::new(KeywordEmbedder::default());
    updater(&cfg, embedder.clone(), handle(&cfg))
        .rebuild(&CancellationFlag::new())
        .await
        .unwrap();

    let live = IndexStore::new(data.path()).current_dir().unwrap();
    std::fs::write(live.join("vectors.bin"), b"garbage").unwrap();
    let updater = updater(&cfg, embedder, handle(&cfg));
    let outcome = updater.run_incremental(&CancellationFlag::new()).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::RebuildRequired);
}

#[tokio::test]
async fn test_only_changed_and_new_sources_are_embedded() {
    let docs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    seed(&docs);
    touch(&docs.path().join("recipes/margarita.txt"), 1_000);
    let cfg = config(docs.path(), data.path());
    let embedder = Arc::new(KeywordEmbedder::default());
    let handle = handle(&cfg);
    let updater = updater(&cfg, embedder.clone(), handle.clone());
    updater.rebuild(&CancellationFlag::new()).await.unwrap();
    let before = handle.snapshot().await.unwrap();
    embedder.reset();

    write_doc(docs.path(), "recipes/margarita.txt", "Tommy's Margarita: tequila, lime, agave");
    touch(&docs.path().join("recipes/margarita.txt"), 2_000);
    write_doc(docs.path(), "recipes/negroni.txt", "Negroni: gin, Campari, sweet vermouth");

    let outcome = updater.run_incremental(&CancellationFlag::new()).await.unwrap();
    let UpdateOutcome::Updated(report) = outcome else {
        panic!("expected an update, got {:?}", outcome);
    };
    assert_eq!(report.listed, 3);
    assert_eq!(report.changed, 2);
    assert_eq!(report.processed, 2);
    assert_eq!(embedder.calls(), 2);

    // Appended, never replaced: the old margarita chunk is still there.
    let after = handle.snapshot().await.unwrap();
    assert_eq!(after.len(), before.len() + 2);
    assert_eq!(before.len(), 2);

    let state = IndexStore::new(data.path()).load_state().unwrap();
    assert_eq!(state.processed_files["recipes/margarita.txt"].last_modified, 2_000_000);
    assert!(state.processed_files.contains_key("recipes/negroni.txt"));
}

#[tokio::test]
async fn test_failed_source_is_skipped_and_retried_next_run() {
    let docs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    seed(&docs);
    let cfg = config(docs.path(), data.path());
    let embedder = Arc::new(KeywordEmbedder::default());
    let updater = updater(&cfg, embedder.clone(), handle(&cfg));
    updater.rebuild(&CancellationFlag::new()).await.unwrap();

    write_doc(docs.path(), "menu.json", "{ this is not json");
    write_doc(docs.path(), "recipes/daiquiri.txt", "Daiquiri: rum, lime, sugar");

    let first = updater.run_incremental(&CancellationFlag::new()).await.unwrap();
    let UpdateOutcome::Updated(report) = first else {
        panic!("expected an update, got {:?}", first);
    };
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 1);

    let second = updater.run_incremental(&CancellationFlag::new()).await.unwrap();
    let UpdateOutcome::Unchanged(report) = second else {
        panic!("expected no persisted change, got {:?}", second);
    };
    assert_eq!(report.changed, 1);
    assert_eq!(report.skipped, 1);

    let state = IndexStore::new(data.path()).load_state().unwrap();
    assert!(!state.processed_files.contains_key("menu.json"));
}

#[tokio::test]
async fn test_deleted_source_stays_in_index() {
    let docs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    seed(&docs);
    let cfg = config(docs.path(), data.path());
    let embedder = Arc::new(KeywordEmbedder::default());
    let handle = handle(&cfg);
    let updater = updater(&cfg, embedder, handle.clone());
    updater.rebuild(&CancellationFlag::new()).await.unwrap();

    std::fs::remove_file(docs.path().join("recipes/mojito.txt")).unwrap();
    assert!(updater.update().await.unwrap());
    assert!(handle
        .snapshot()
        .await
        .unwrap()
        .source_keys()
        .contains("recipes/mojito.txt"));
}

#[tokio::test]
async fn test_listing_failure_is_an_error() {
    let docs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    seed(&docs);
    let cfg = config(docs.path(), data.path());
    let embedder = Arc::new(KeywordEmbedder::default());
    let updater = updater(&cfg, embedder, handle(&cfg));
    updater.rebuild(&CancellationFlag::new()).await.unwrap();

    drop(docs);
    assert!(updater.update().await.is_err());
}

#[tokio::test]
async fn test_failed_commit_does_not_duplicate_rows_on_retry() {
    let docs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    seed(&docs);
    let cfg = config(docs.path(), data.path());
    let embedder = Arc::new(KeywordEmbedder::default());
    let handle = handle(&cfg);
    let updater = updater(&cfg, embedder, handle.clone());
    updater.rebuild(&CancellationFlag::new()).await.unwrap();

    write_doc(docs.path(), "recipes/negroni.txt", "Negroni: gin, Campari, sweet vermouth");
    // The pointer switch cannot write its temp file.
    let blocker = data.path().join("CURRENT.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(updater.run_incremental(&CancellationFlag::new()).await.is_err());

    let store = IndexStore::new(data.path());
    let (index, state) = store.load().unwrap();
    assert_eq!(index.len(), 2);
    assert!(!state.processed_files.contains_key("recipes/negroni.txt"));

    std::fs::remove_dir(&blocker).unwrap();
    handle.invalidate();
    let outcome = updater.run_incremental(&CancellationFlag::new()).await.unwrap();
    let UpdateOutcome::Updated(report) = outcome else {
        panic!("expected an update, got {:?}", outcome);
    };
    assert_eq!(report.chunks_added, 1);
    assert_eq!(report.total_entries, 3);

    let index = store.load_index().unwrap();
    let negroni_rows = index
        .chunks()
        .iter()
        .filter(|c| c.source_key == "recipes/negroni.txt")
        .count();
    assert_eq!(negroni_rows, 1);
}
