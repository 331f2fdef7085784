//! In-memory job bookkeeping shared by the backends.
//!
//! [`HandleMap`] pairs job ids with backend handles in both directions;
//! every mutation touches both sides. [`JobTable`] owns the job snapshots and
//! the handle map together, and hands out per-job query tickets so that a
//! status report is only applied if nothing newer was applied before it.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::{DownloadJob, JobStatus, Progress};

/// Finished jobs kept for `get_status` before the oldest are evicted
pub const DEFAULT_FINISHED_RETENTION: usize = 256;

/// Bidirectional job id <-> backend handle map
#[derive(Debug, Default, Clone)]
pub struct HandleMap {
    by_job: HashMap<String, String>,
    by_handle: HashMap<String, String>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `job_id` with `handle`, dropping any previous pairing of either
    pub fn insert(&mut self, job_id: &str, handle: &str) {
        self.remove_job(job_id);
        self.remove_handle(handle);
        self.by_job.insert(job_id.to_string(), handle.to_string());
        self.by_handle.insert(handle.to_string(), job_id.to_string());
    }

    pub fn remove_job(&mut self, job_id: &str) -> Option<String> {
        let handle = self.by_job.remove(job_id)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    pub fn remove_handle(&mut self, handle: &str) -> Option<String> {
        let job_id = self.by_handle.remove(handle)?;
        self.by_job.remove(&job_id);
        Some(job_id)
    }

    pub fn handle_of(&self, job_id: &str) -> Option<&str> {
        self.by_job.get(job_id).map(String::as_str)
    }

    pub fn job_of(&self, handle: &str) -> Option<&str> {
        self.by_handle.get(handle).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_job.is_empty()
    }

    /// Both directions describe the same pairs
    pub fn is_consistent(&self) -> bool {
        self.by_job.len() == self.by_handle.len()
            && self
                .by_job
                .iter()
                .all(|(job, handle)| self.by_handle.get(handle) == Some(job))
    }
}

/// A status report from a backend, already translated to local terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: JobStatus,
    pub progress: Progress,
    pub error: Option<String>,
}

/// Result of folding a report into the table
#[derive(Debug, Clone)]
pub struct Applied {
    pub previous: JobStatus,
    pub job: DownloadJob,
}

#[derive(Debug)]
struct Tracked {
    job: DownloadJob,
    issued: u64,
    applied: u64,
    /// Order in which the job reached a terminal state
    finished: Option<u64>,
}

/// A job that needs its status queried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub job_id: String,
    pub handle: String,
    pub ticket: u64,
}

#[derive(Debug)]
pub struct JobTable {
    jobs: HashMap<String, Tracked>,
    handles: HandleMap,
    finished_seq: u64,
    retain_finished: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that keeps at most `retain_finished` terminal jobs (at least one)
    pub fn with_retention(retain_finished: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            handles: HandleMap::new(),
            finished_seq: 0,
            retain_finished: retain_finished.max(1),
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Track a job the backend accepted under `handle`
    pub fn insert(&mut self, job: DownloadJob, handle: &str) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(Error::InvalidState(format!("job {} is already tracked", job.id)));
        }
        self.handles.insert(&job.id, handle);
        self.jobs.insert(
            job.id.clone(),
            Tracked {
                job,
                issued: 0,
                applied: 0,
                finished: None,
            },
        );
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<DownloadJob> {
        self.jobs.get(job_id).map(|t| t.job.clone())
    }

    pub fn all(&self) -> Vec<DownloadJob> {
        self.jobs.values().map(|t| t.job.clone()).collect()
    }

    pub fn handle_of(&self, job_id: &str) -> Option<String> {
        self.handles.handle_of(job_id).map(str::to_string)
    }

    pub fn job_of(&self, handle: &str) -> Option<String> {
        self.handles.job_of(handle).map(str::to_string)
    }

    pub fn handles(&self) -> &HandleMap {
        &self.handles
    }

    /// The job, provided it exists and is not terminal
    pub fn live(&self, job_id: &str) -> Result<DownloadJob> {
        let job = self
            .get(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        if job.status.is_terminal() {
            return Err(Error::InvalidState(format!("job {} is {}", job_id, job.status)));
        }
        Ok(job)
    }

    /// Apply `f` to the job and return the new snapshot. Invalidates
    /// outstanding query tickets so older reports cannot undo the change.
    pub fn update<F>(&mut self, job_id: &str, f: F) -> Option<DownloadJob>
    where
        F: FnOnce(&mut DownloadJob),
    {
        let tracked = self.jobs.get_mut(job_id)?;
        f(&mut tracked.job);
        tracked.issued += 1;
        tracked.applied = tracked.issued;
        let job = tracked.job.clone();
        if job.status.is_terminal() {
            self.finish(job_id);
        }
        Some(job)
    }

    /// Drop the job and its handle from every table
    pub fn purge(&mut self, job_id: &str) -> Option<(DownloadJob, Option<String>)> {
        let tracked = self.jobs.remove(job_id)?;
        let handle = self.handles.remove_job(job_id);
        Some((tracked.job, handle))
    }

    /// Move a live job onto a new backend handle, e.g. when the backend hands
    /// the transfer over to a follow-up download. Obeys the same ticket rule
    /// as [`apply`](Self::apply).
    pub fn rebind(&mut self, job_id: &str, ticket: u64, handle: &str) -> bool {
        let Some(tracked) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if ticket <= tracked.applied || tracked.job.status.is_terminal() {
            return false;
        }
        tracked.applied = ticket;
        self.handles.insert(job_id, handle);
        true
    }

    /// Issue a query ticket for every non-terminal job that has a handle
    pub fn poll_targets(&mut self) -> Vec<PollTarget> {
        let mut targets = Vec::new();
        for (job_id, tracked) in self.jobs.iter_mut() {
            if tracked.job.status.is_terminal() {
                continue;
            }
            if let Some(handle) = self.handles.handle_of(job_id) {
                tracked.issued += 1;
                targets.push(PollTarget {
                    job_id: job_id.clone(),
                    handle: handle.to_string(),
                    ticket: tracked.issued,
                });
            }
        }
        targets
    }

    /// Fold a report obtained with `ticket`. Stale tickets, unknown ids and
    /// terminal jobs are ignored. Progress never decreases while the job
    /// stays Active.
    pub fn apply(&mut self, job_id: &str, ticket: u64, report: StatusReport) -> Option<Applied> {
        let tracked = self.jobs.get_mut(job_id)?;
        if ticket <= tracked.applied || tracked.job.status.is_terminal() {
            return None;
        }
        tracked.applied = ticket;

        let previous = tracked.job.status;
        let job = &mut tracked.job;
        job.progress = if previous == JobStatus::Active && report.status == JobStatus::Active {
            job.progress.advance(report.progress)
        } else {
            report.progress
        };
        job.status = report.status;
        job.error_state = if report.status == JobStatus::Failed {
            report.error.or_else(|| Some("download failed".to_string()))
        } else {
            None
        };

        let job = job.clone();
        if job.status.is_terminal() {
            self.finish(job_id);
        }
        Some(Applied { previous, job })
    }

    /// Release the handle of a job that just turned terminal and evict the
    /// oldest finished jobs beyond the retention limit
    fn finish(&mut self, job_id: &str) {
        self.handles.remove_job(job_id);
        if let Some(tracked) = self.jobs.get_mut(job_id) {
            if tracked.finished.is_none() {
                self.finished_seq += 1;
                tracked.finished = Some(self.finished_seq);
            }
        }

        let mut finished: Vec<(u64, String)> = self
            .jobs
            .iter()
            .filter_map(|(id, t)| t.finished.map(|seq| (seq, id.clone())))
            .collect();
        if finished.len() <= self.retain_finished {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - self.retain_finished;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}
