//! In-memory [`Downloader`] driven by the caller.
//!
//! Nothing is transferred. Tests and tools move jobs along with
//! [`MemoryDownloader::report_progress`], [`MemoryDownloader::complete`] and
//! [`MemoryDownloader::fail`], and observe the same events a real backend
//! would emit.

use async_channel::Receiver;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::events::{EventHub, JobEvent};
use crate::registry::{JobTable, StatusReport};
use crate::types::{DownloadJob, JobStatus, Progress, SourceType};

pub struct MemoryDownloader {
    supported: Vec<SourceType>,
    table: Mutex<JobTable>,
    hub: EventHub,
    next_handle: AtomicU64,
}

impl Default for MemoryDownloader {
    fn default() -> Self {
        Self::new(&[SourceType::Torrent, SourceType::Http, SourceType::RemoteStream, SourceType::Local])
    }
}

impl MemoryDownloader {
    pub fn new(supported: &[SourceType]) -> Self {
        Self {
            supported: supported.to_vec(),
            table: Mutex::new(JobTable::new()),
            hub: EventHub::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a backend-style report into the job and emit what it implies
    fn report(&self, id: &str, status: JobStatus, progress: Progress, error: Option<String>) -> Result<DownloadJob> {
        let applied = {
            let mut table = self.table();
            table.live(id)?;
            let ticket = table
                .poll_targets()
                .into_iter()
                .find(|t| t.job_id == id)
                .map(|t| t.ticket)
                .ok_or_else(|| Error::InvalidState(format!("job {} has no handle", id)))?;
            table.apply(id, ticket, StatusReport { status, progress, error })
        };
        let applied = applied.ok_or_else(|| Error::InvalidState(format!("job {} did not accept the report", id)))?;

        self.hub.emit(JobEvent::Progress(applied.job.clone(), applied.job.progress));
        if let Some(event) = JobEvent::for_transition(applied.previous, &applied.job) {
            self.hub.emit(event);
        }
        Ok(applied.job)
    }

    pub fn report_progress(&self, id: &str, completed: u64, total: u64) -> Result<DownloadJob> {
        let status = self.table().live(id)?.status;
        self.report(id, status, Progress::from_counts(completed, total, None), None)
    }

    pub fn complete(&self, id: &str) -> Result<DownloadJob> {
        let current = self.table().live(id)?.progress;
        let total = current.total_bytes.max(current.bytes_downloaded);
        let mut progress = Progress::from_counts(total, total, None);
        progress.percent = 100;
        self.report(id, JobStatus::Completed, progress, None)
    }

    pub fn fail(&self, id: &str, message: &str) -> Result<DownloadJob> {
        let current = self.table().live(id)?.progress;
        self.report(id, JobStatus::Failed, current, Some(message.to_string()))
    }
}

#[async_trait]
impl Downloader for MemoryDownloader {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports(&self, source_type: SourceType) -> bool {
        self.supported.contains(&source_type)
    }

    async fn start(&self, mut job: DownloadJob) -> Result<DownloadJob> {
        if !self.supports(job.source_type) {
            return Err(Error::UnsupportedSourceType(job.source_type));
        }
        let handle = format!("mem-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        job.status = JobStatus::Active;
        self.table().insert(job.clone(), &handle)?;
        self.hub.emit(JobEvent::Started(job.clone()));
        Ok(job)
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let job = self.table().live(id)?;
        if job.status != JobStatus::Active {
            return Err(Error::InvalidState(format!("cannot pause job {} while {}", id, job.status)));
        }
        if let Some(job) = self.table().update(id, |job| job.status = JobStatus::Paused) {
            self.hub.emit(JobEvent::Paused(job));
        }
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        let job = self.table().live(id)?;
        if job.status != JobStatus::Paused {
            return Err(Error::InvalidState(format!("cannot resume job {} while {}", id, job.status)));
        }
        if let Some(job) = self.table().update(id, |job| job.status = JobStatus::Active) {
            self.hub.emit(JobEvent::Resumed(job));
        }
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let purged = {
            let mut table = self.table();
            table.live(id)?;
            table.purge(id)
        };
        if let Some((mut job, _)) = purged {
            job.status = JobStatus::Canceled;
            self.hub.emit(JobEvent::Canceled(job));
        }
        Ok(())
    }

    async fn get_status(&self, id: &str) -> Option<DownloadJob> {
        self.table().get(id)
    }

    async fn jobs(&self) -> Vec<DownloadJob> {
        self.table().all()
    }

    fn subscribe(&self) -> Receiver<JobEvent> {
        self.hub.subscribe()
    }

    async fn shutdown(&self) -> Result<()> {
        self.hub.close();
        Ok(())
    }
}
