//! Job queue port for asynchronous dispatch.
//!
//! Dispatching creates the execution record first, then hands a [`QueuedJob`]
//! naming that record to a [`JobQueue`]. A worker later claims due jobs and
//! resumes the record through the same state machine as inline execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use runway_core::{RecordId, Time};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::lock::file_safe;

/// Queue failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task '{0}' is already queued")]
    Duplicate(String),

    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue entry is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// A dispatched task waiting for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Task name
    pub task: String,
    /// Execution record created at dispatch
    pub record_id: RecordId,
    pub queue: String,
    /// Earliest time a worker may run the job
    pub available_at: Time,
    pub enqueued_at: Time,
    /// At most one pending job per task
    #[serde(default)]
    pub unique: bool,
    /// Safe to run more than once
    #[serde(default)]
    pub idempotent: bool,
}

impl QueuedJob {
    /// Create a job that becomes available after `delay`.
    pub fn new(task: impl Into<String>, record_id: RecordId, queue: impl Into<String>, delay: Duration) -> Self {
        let now = Utc::now();
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            task: task.into(),
            record_id,
            queue: queue.into(),
            available_at: now + delay,
            enqueued_at: now,
            unique: false,
            idempotent: false,
        }
    }

    /// Mark the job unique.
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Mark the job idempotent.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Whether a worker may run the job at `now`.
    pub fn is_due(&self, now: Time) -> bool {
        self.available_at <= now
    }
}

/// Where dispatched tasks wait.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Unique jobs are rejected while another job for the same task is pending.
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Claim every job on `queue` that is due at `now`, oldest first.
    async fn take_due(&self, queue: &str, now: Time) -> Result<Vec<QueuedJob>, QueueError>;

    /// Jobs still waiting on `queue`.
    async fn pending(&self, queue: &str) -> Result<Vec<QueuedJob>, QueueError>;
}

fn sort_jobs(jobs: &mut [QueuedJob]) {
    jobs.sort_by(|a, b| {
        a.available_at
            .cmp(&b.available_at)
            .then_with(|| a.record_id.cmp(&b.record_id))
    });
}

/// Queue kept in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobQueue {
    jobs: Arc<Mutex<Vec<QueuedJob>>>,
}

impl InMemoryJobQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pending job across all queues.
    pub async fn jobs(&self) -> Vec<QueuedJob> {
        self.jobs.lock().await.clone()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().await;
        if job.unique && jobs.iter().any(|j| j.task == job.task) {
            return Err(QueueError::Duplicate(job.task));
        }
        jobs.push(job);
        Ok(())
    }

    async fn take_due(&self, queue: &str, now: Time) -> Result<Vec<QueuedJob>, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let (mut due, rest): (Vec<_>, Vec<_>) = jobs
            .drain(..)
            .partition(|j| j.queue == queue && j.is_due(now));
        *jobs = rest;
        sort_jobs(&mut due);
        Ok(due)
    }

    async fn pending(&self, queue: &str) -> Result<Vec<QueuedJob>, QueueError> {
        let mut pending: Vec<_> = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect();
        sort_jobs(&mut pending);
        Ok(pending)
    }
}

/// Queue stored as one JSON file per job under `<root>/<queue>/`.
///
/// Workers claim a job by renaming its file, so two workers sharing the
/// directory never run the same job.
#[derive(Debug, Clone)]
pub struct FileJobQueue {
    root: PathBuf,
}

impl FileJobQueue {
    /// Create a queue rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, QueueError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(file_safe(queue))
    }

    async fn read_dir(&self, queue: &str) -> Result<Vec<(PathBuf, QueuedJob)>, QueueError> {
        Self::read_jobs(&self.queue_dir(queue)).await
    }

    /// Pending jobs on every queue under the root.
    async fn read_all(&self) -> Result<Vec<QueuedJob>, QueueError> {
        let mut queues = tokio::fs::read_dir(&self.root).await?;
        let mut jobs = Vec::new();
        while let Some(entry) = queues.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                jobs.extend(Self::read_jobs(&entry.path()).await?.into_iter().map(|(_, j)| j));
            }
        }
        Ok(jobs)
    }

    async fn read_jobs(dir: &Path) -> Result<Vec<(PathBuf, QueuedJob)>, QueueError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<QueuedJob>(&bytes) {
                    Ok(job) => jobs.push((path, job)),
                    Err(e) => warn!("Ignoring unreadable job {}: {}", path.display(), e),
                },
                // Claimed by another worker between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobQueue for FileJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        if job.unique {
            let pending = self.read_all().await?;
            if pending.iter().any(|j| j.task == job.task) {
                return Err(QueueError::Duplicate(job.task));
            }
        }

        let dir = self.queue_dir(&job.queue);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", job.record_id));
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&job)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Enqueued {} at {}", job.task, path.display());
        Ok(())
    }

    async fn take_due(&self, queue: &str, now: Time) -> Result<Vec<QueuedJob>, QueueError> {
        let mut claimed = Vec::new();
        for (path, job) in self.read_dir(queue).await? {
            if !job.is_due(now) {
                continue;
            }
            let claim = path.with_extension("claimed");
            match tokio::fs::rename(&path, &claim).await {
                Ok(()) => {
                    tokio::fs::remove_file(&claim).await?;
                    claimed.push(job);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Job {} claimed elsewhere", job.record_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        sort_jobs(&mut claimed);
        Ok(claimed)
    }

    async fn pending(&self, queue: &str) -> Result<Vec<QueuedJob>, QueueError> {
        let mut jobs: Vec<_> = self.read_dir(queue).await?.into_iter().map(|(_, j)| j).collect();
        sort_jobs(&mut jobs);
        Ok(jobs)
    }
}
