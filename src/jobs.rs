//! Background index update jobs.
//!
//! An [`UpdateJob`] wraps one updater run in a tokio task with an id, an
//! observable [`JobStatus`], and a cancel switch:
//!
//! ```text
//! Pending ─► Running ─► Succeeded(outcome)
//!                   └─► Failed(message)
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancellationFlag;
use crate::updater::{IndexUpdater, UpdateOutcome, UpdateReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Incremental, falling back to a full rebuild when one is required.
    Update,
    /// Incremental only; reports `RebuildRequired` instead of rebuilding.
    Incremental,
    Rebuild,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Updated(UpdateReport),
    Unchanged(UpdateReport),
    Rebuilt(UpdateReport),
    RebuildRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded(JobOutcome),
    Failed(String),
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded(_) | JobStatus::Failed(_))
    }
}

pub struct UpdateJob {
    id: Uuid,
    kind: JobKind,
    status: watch::Receiver<JobStatus>,
    cancel: CancellationFlag,
    handle: JoinHandle<()>,
}

impl UpdateJob {
    /// Start `kind` on the current tokio runtime.
    pub fn spawn(updater: Arc<IndexUpdater>, kind: JobKind) -> Self {
        let id = Uuid::new_v4();
        let (tx, status) = watch::channel(JobStatus::Pending);
        let cancel = CancellationFlag::new();
        let flag = cancel.clone();

        let handle = tokio::spawn(async move {
            tx.send_replace(JobStatus::Running);
            info!(job = %id, ?kind, "index job started");
            let result = run(&updater, kind, &flag).await;
            let status = match result {
                Ok(outcome) => {
                    info!(job = %id, "index job succeeded");
                    JobStatus::Succeeded(outcome)
                }
                Err(e) => {
                    warn!(job = %id, error = %e, "index job failed");
                    JobStatus::Failed(format!("{:#}", e))
                }
            };
            tx.send_replace(status);
        });

        Self {
            id,
            kind,
            status,
            cancel,
            handle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }

    /// Ask the job to stop at its next checkpoint. Nothing is persisted
    /// by a cancelled run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A flag that cancels this job, usable after [`UpdateJob::wait`] takes it.
    pub fn cancel_handle(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Wait for the job to finish and return its final status.
    pub async fn wait(mut self) -> JobStatus {
        if let Err(e) = (&mut self.handle).await {
            return JobStatus::Failed(format!("index job panicked: {}", e));
        }
        let status = self.status.borrow_and_update().clone();
        status
    }
}

async fn run(
    updater: &IndexUpdater,
    kind: JobKind,
    cancel: &CancellationFlag,
) -> anyhow::Result<JobOutcome> {
    if kind == JobKind::Rebuild {
        return Ok(JobOutcome::Rebuilt(updater.rebuild(cancel).await?));
    }
    match updater.run_incremental(cancel).await? {
        UpdateOutcome::Updated(report) => Ok(JobOutcome::Updated(report)),
        UpdateOutcome::Unchanged(report) => Ok(JobOutcome::Unchanged(report)),
        UpdateOutcome::RebuildRequired if kind == JobKind::Update => {
            info!("incremental update not possible, rebuilding");
            Ok(JobOutcome::Rebuilt(updater.rebuild(cancel).await?))
        }
        UpdateOutcome::RebuildRequired => Ok(JobOutcome::RebuildRequired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, Embedder};
    use crate::config::Config;
    use crate::extract::DefaultExtractor;
    use crate::index_store::{IndexHandle, IndexStore};
    use crate::sources::{DocumentSource, SourceListing};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct OneDoc;

    #[async_trait]
    impl DocumentSource for OneDoc {
        fn name(&self) -> &str {
            "one"
        }
        async fn list(&self) -> anyhow::Result<Vec<SourceListing>> {
            Ok(vec![SourceListing {
                key: "negroni.txt".into(),
                last_modified: 10,
                size_bytes: 30,
            }])
        }
        async fn fetch(&self, _key: &str) -> anyhow::Result<Vec<u8>> {
            Ok(b"Negroni: gin, Campari, vermouth".to_vec())
        }
    }

    struct Constant;

    #[async_trait]
    impl Embedder for Constant {
        fn model_name(&self) -> &str {
            "constant"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            Ok(texts.iter().map(|_| vec![0.0, 1.0, 0.0]).collect())
        }
    }

    fn updater(tmp: &TempDir) -> Arc<IndexUpdater> {
        Arc::new(IndexUpdater::new(
            Arc::new(OneDoc),
            Arc::new(DefaultExtractor),
            Arc::new(Constant),
            Arc::new(IndexHandle::new(IndexStore::new(tmp.path()), Duration::from_secs(60))),
            &Config::default(),
        ))
    }

    #[tokio::test]
    async fn test_update_job_rebuilds_when_needed() {
        let tmp = TempDir::new().unwrap();
        let job = UpdateJob::spawn(updater(&tmp), JobKind::Update);
        match job.wait().await {
            JobStatus::Succeeded(JobOutcome::Rebuilt(report)) => assert_eq!(report.processed, 1),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incremental_job_reports_rebuild_required() {
        let tmp = TempDir::new().unwrap();
        let job = UpdateJob::spawn(updater(&tmp), JobKind::Incremental);
        assert_eq!(job.wait().await, JobStatus::Succeeded(JobOutcome::RebuildRequired));
    }

    #[tokio::test]
    async fn test_second_update_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        let updater = updater(&tmp);
        UpdateJob::spawn(updater.clone(), JobKind::Rebuild).wait().await;
        let status = UpdateJob::spawn(updater, JobKind::Update).wait().await;
        assert!(matches!(status, JobStatus::Succeeded(JobOutcome::Unchanged(_))));
    }

    #[tokio::test]
    async fn test_cancelled_job_fails() {
        let tmp = TempDir::new().unwrap();
        let job = UpdateJob::spawn(updater(&tmp), JobKind::Rebuild);
        job.cancel();
        let status = job.wait().await;
        // The job may finish before the cancel lands.
        assert!(status.is_finished());
        if let JobStatus::Failed(message) = status {
            assert!(message.contains("cancelled"));
        }
    }
}
