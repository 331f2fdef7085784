//! Resume bookkeeping
//!
//! Keeps a durable snapshot of every job that was Active or Paused so it can
//! be started again after the process restarts. Every save rewrites the whole
//! persisted set. A single writer is assumed.

mod json;
mod tracker;

pub use json::JsonResumeStore;
pub use tracker::ResumeTracker;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::types::{DownloadJob, FileSelection, JobStatus, Progress, SourceType};

/// Durable projection of an in-flight job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub id: String,
    pub source_type: SourceType,
    pub source_urn: String,
    pub status: JobStatus,
    pub progress: Progress,
    #[serde(default)]
    pub file_selection: Option<FileSelection>,
    pub saved_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn from_job(job: &DownloadJob) -> Self {
        Self {
            id: job.id.clone(),
            source_type: job.source_type,
            source_urn: job.source_urn.clone(),
            status: job.status,
            progress: job.progress,
            file_selection: job.file_selection.clone(),
            saved_at: Utc::now(),
        }
    }

    /// A Queued job with the same identity, ready to be started again
    pub fn to_job(&self) -> DownloadJob {
        let mut job = DownloadJob::with_id(self.id.clone(), self.source_type, self.source_urn.clone());
        job.progress = Progress {
            speed: None,
            ..self.progress
        };
        job.file_selection = self.file_selection.clone();
        job
    }
}

/// Where resume records live
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Every persisted record; an absent store reads as empty
    async fn load_all(&self) -> Result<Vec<ResumeRecord>>;

    /// Replace the persisted set with `records`
    async fn replace_all(&self, records: &[ResumeRecord]) -> Result<()>;
}

#[async_trait]
impl<T: ResumeStore + ?Sized> ResumeStore for Arc<T> {
    async fn load_all(&self) -> Result<Vec<ResumeRecord>> {
        (**self).load_all().await
    }

    async fn replace_all(&self, records: &[ResumeRecord]) -> Result<()> {
        (**self).replace_all(records).await
    }
}

pub struct ResumePersistence<S> {
    store: S,
}

impl<S: ResumeStore> ResumePersistence<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record the job's current state. Only Active and Paused jobs are kept;
    /// saving a job in any other state evicts it.
    pub async fn save_download_state(&self, job: &DownloadJob) -> Result<()> {
        let mut records = self.store.load_all().await?;
        records.retain(|r| r.id != job.id);
        if job.status.is_resumable() {
            records.push(ResumeRecord::from_job(job));
        }
        self.store.replace_all(&records).await
    }

    pub async fn load_incomplete_downloads(&self) -> Result<Vec<ResumeRecord>> {
        let records = self.store.load_all().await?;
        Ok(records.into_iter().filter(|r| r.status.is_resumable()).collect())
    }

    pub async fn remove_download(&self, id: &str) -> Result<()> {
        let mut records = self.store.load_all().await?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() != before {
            self.store.replace_all(&records).await?;
        }
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.store.replace_all(&[]).await
    }

    pub async fn get_resume_data(&self, id: &str) -> Result<Option<ResumeRecord>> {
        let records = self.store.load_all().await?;
        Ok(records.into_iter().find(|r| r.id == id))
    }

    /// Drop entries saved more than `max_age_days` ago, returning how many
    pub async fn cleanup_stale_data(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let mut records = self.store.load_all().await?;
        let before = records.len();
        records.retain(|r| r.saved_at >= cutoff);
        let removed = before - records.len();
        if removed > 0 {
            self.store.replace_all(&records).await?;
            log::info!("Removed {} stale resume entries", removed);
        }
        Ok(removed)
    }
}
