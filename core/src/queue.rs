//! Idle/active job lists shared by every worker process.
//!
//! A job is always in exactly one of the two lists. Moves between them are
//! single store operations, so concurrent pulls never hand out the same job.

use crate::error::{Error, Result};
use crate::job::{sort_jobs, Job};
use crate::store::{CoordStore, List};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn CoordStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self { store }
    }

    pub async fn enqueue_idle(&self, jobs: &[Job]) -> Result<()> {
        let entries: Vec<String> = jobs.iter().map(Job::encode).collect();
        self.store.push_all(List::Idle, &entries).await?;
        tracing::info!(jobs = entries.len(), "enqueued idle jobs");
        Ok(())
    }

    /// Fills the idle list from the manifest, deepest paths first, but only on
    /// a pristine queue. Any existing work makes this a `BootstrapConflict`.
    pub async fn bootstrap(&self, manifest: &HashMap<String, String>) -> Result<usize> {
        let idle = self.idle_len().await?;
        let active = self.active_len().await?;
        let completed = self.is_exhausted().await?;
        if idle > 0 || active > 0 || completed {
            return Err(Error::BootstrapConflict { idle, active, completed });
        }
        let jobs = sort_jobs(manifest);
        self.enqueue_idle(&jobs).await?;
        Ok(jobs.len())
    }

    /// Claims the head of idle and returns it; the claim also counts the
    /// document. An empty idle list marks the queue exhausted and yields
    /// `None`. Entries that do not decode are released and skipped.
    pub async fn pull_next(&self) -> Result<Option<Job>> {
        loop {
            let entry = match self.store.claim_next().await? {
                Some(entry) => entry,
                None => {
                    self.store.set_flag(&self.store.keys().jobs_completed(), true).await?;
                    tracing::info!("no more jobs available");
                    return Ok(None);
                }
            };
            match Job::decode(&entry) {
                Ok(job) => {
                    tracing::debug!(path = %job.path, "pulled job");
                    return Ok(Some(job));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed queue entry");
                    self.store.release_claim(&entry).await?;
                }
            }
        }
    }

    pub async fn complete(&self, job: &Job) -> Result<()> {
        if !self.store.remove_one(List::Active, &job.encode()).await? {
            tracing::warn!(path = %job.path, "completed job was not in the active list");
        }
        tracing::debug!(path = %job.path, "completed job");
        Ok(())
    }

    /// Moves every active job back to idle, uncounting each one. Leaves
    /// postings alone; see [`JobQueue::recover_active`].
    pub async fn requeue_all_active(&self) -> Result<usize> {
        self.store.requeue_active(false).await
    }

    /// Requeues every active job and strips its partial postings in the same
    /// atomic step, so no query can observe half-indexed documents.
    pub async fn recover_active(&self) -> Result<usize> {
        let moved = self.store.requeue_active(true).await?;
        if moved > 0 {
            tracing::warn!(jobs = moved, "recovered unfinished jobs to idle");
        }
        Ok(moved)
    }

    pub async fn is_exhausted(&self) -> Result<bool> {
        self.store.flag(&self.store.keys().jobs_completed()).await
    }

    pub async fn idle_len(&self) -> Result<usize> {
        self.store.len(List::Idle).await
    }

    pub async fn active_len(&self) -> Result<usize> {
        self.store.len(List::Active).await
    }

    pub async fn idle(&self) -> Result<Vec<Job>> {
        self.decoded(List::Idle).await
    }

    pub async fn active(&self) -> Result<Vec<Job>> {
        self.decoded(List::Active).await
    }

    async fn decoded(&self, list: List) -> Result<Vec<Job>> {
        let entries = self.store.range(list).await?;
        Ok(entries.iter().filter_map(|e| Job::decode(e).ok()).collect())
    }
}
