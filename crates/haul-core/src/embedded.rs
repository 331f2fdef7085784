//! [`Downloader`] over an in-process transfer engine.
//!
//! The engine pushes signals; a listener task folds each one into the job
//! table as it arrives, so there is no polling on this side.

use async_channel::Receiver;
use async_trait::async_trait;
use log::Level;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::downloader::Downloader;
use crate::engine_adapter::{EngineRequest, EngineSignal, TransferEngine};
use crate::error::{Error, Result};
use crate::events::{EventHub, JobEvent};
use crate::journal::Journal;
use crate::registry::JobTable;
use crate::retry::RetryPolicy;
use crate::storage::Storage;
use crate::types::{DownloadJob, JobStatus, Progress, SourceType};

struct Shared {
    engine: Arc<dyn TransferEngine>,
    storage: Arc<dyn Storage>,
    journal: Arc<dyn Journal>,
    hub: EventHub,
    table: Mutex<JobTable>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct EmbeddedEngineDownloader {
    shared: Arc<Shared>,
    retry: RetryPolicy,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddedEngineDownloader {
    /// Must be called from within a Tokio runtime; the signal listener starts
    /// immediately.
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        storage: Arc<dyn Storage>,
        retry: RetryPolicy,
        journal: Arc<dyn Journal>,
    ) -> Self {
        let signals = engine.signals();
        let shared = Arc::new(Shared {
            engine,
            storage,
            journal,
            hub: EventHub::new(),
            table: Mutex::new(JobTable::new()),
        });
        let listener = tokio::spawn(listen(shared.clone(), signals));

        Self {
            shared,
            retry,
            listener: Mutex::new(Some(listener)),
        }
    }

    fn handle(&self, id: &str) -> Result<String> {
        self.shared
            .table()
            .handle_of(id)
            .ok_or_else(|| Error::InvalidState(format!("job {} has no engine handle", id)))
    }

    fn transition(&self, id: &str, status: JobStatus) -> Option<DownloadJob> {
        let job = self.shared.table().update(id, |job| job.status = status)?;
        self.shared.journal.record(
            Level::Info,
            "job status changed",
            &[("job", id.to_string()), ("to", status.to_string())],
        );
        Some(job)
    }
}

#[async_trait]
impl Downloader for EmbeddedEngineDownloader {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn supports(&self, source_type: SourceType) -> bool {
        matches!(source_type, SourceType::Torrent | SourceType::Http)
    }

    async fn start(&self, mut job: DownloadJob) -> Result<DownloadJob> {
        if !self.supports(job.source_type) {
            return Err(Error::UnsupportedSourceType(job.source_type));
        }
        if self.shared.table().contains(&job.id) {
            return Err(Error::InvalidState(format!("job {} is already tracked", job.id)));
        }

        let mut selected_files = Vec::new();
        if let Some(selection) = &job.file_selection {
            if selection.needs_manifest() {
                self.shared.journal.record(
                    Level::Warn,
                    "patterns and episodes are ignored by the embedded engine",
                    &[("job", job.id.clone())],
                );
            }
            selected_files = selection.file_indices.clone();
            selected_files.sort_unstable();
            selected_files.dedup();
        }

        let request = EngineRequest {
            source_type: job.source_type,
            source_urn: job.source_urn.clone(),
            save_dir: self.shared.storage.partial_path(&job),
            selected_files,
        };

        let engine = &self.shared.engine;
        let journal = &self.shared.journal;
        let handle = self
            .retry
            .run_with(
                || engine.add(&request),
                |attempt, err, delay| {
                    journal.record(
                        Level::Warn,
                        "retrying engine add",
                        &[
                            ("job", job.id.clone()),
                            ("attempt", attempt.to_string()),
                            ("delay_ms", delay.as_millis().to_string()),
                            ("error", err.to_string()),
                        ],
                    );
                },
            )
            .await?;

        job.status = JobStatus::Active;
        job.error_state = None;
        let inserted = self.shared.table().insert(job.clone(), &handle);
        if let Err(e) = inserted {
            let _ = engine.destroy(&handle, true).await;
            return Err(e);
        }

        journal.record(
            Level::Info,
            "job started",
            &[("job", job.id.clone()), ("handle", handle), ("source", job.source_urn.clone())],
        );
        self.shared.hub.emit(JobEvent::Started(job.clone()));
        Ok(job)
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let job = self.shared.table().live(id)?;
        if job.status != JobStatus::Active {
            return Err(Error::InvalidState(format!("cannot pause job {} while {}", id, job.status)));
        }
        let handle = self.handle(id)?;
        self.shared.engine.pause(&handle).await?;

        if let Some(job) = self.transition(id, JobStatus::Paused) {
            self.shared.hub.emit(JobEvent::Paused(job));
        }
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        let job = self.shared.table().live(id)?;
        if job.status != JobStatus::Paused {
            return Err(Error::InvalidState(format!("cannot resume job {} while {}", id, job.status)));
        }
        let handle = self.handle(id)?;
        self.shared.engine.resume(&handle).await?;

        if let Some(job) = self.transition(id, JobStatus::Active) {
            self.shared.hub.emit(JobEvent::Resumed(job));
        }
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let handle = {
            let table = self.shared.table();
            table.live(id)?;
            table.handle_of(id)
        };

        if let Some(handle) = handle {
            if let Err(e) = self.shared.engine.destroy(&handle, true).await {
                self.shared.journal.record(
                    Level::Warn,
                    "engine destroy failed",
                    &[("job", id.to_string()), ("error", e.to_string())],
                );
            }
        }

        let purged = self.shared.table().purge(id);
        if let Some((mut job, _)) = purged {
            job.status = JobStatus::Canceled;
            self.shared
                .journal
                .record(Level::Info, "job canceled", &[("job", id.to_string())]);
            self.shared.hub.emit(JobEvent::Canceled(job));
        }
        Ok(())
    }

    async fn get_status(&self, id: &str) -> Option<DownloadJob> {
        self.shared.table().get(id)
    }

    async fn jobs(&self) -> Vec<DownloadJob> {
        self.shared.table().all()
    }

    fn subscribe(&self) -> Receiver<JobEvent> {
        self.shared.hub.subscribe()
    }

    async fn shutdown(&self) -> Result<()> {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = listener {
            task.abort();
        }
        self.shared.hub.close();
        Ok(())
    }
}

impl Drop for EmbeddedEngineDownloader {
    fn drop(&mut self) {
        if let Some(task) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

async fn listen(shared: Arc<Shared>, mut signals: broadcast::Receiver<EngineSignal>) {
    loop {
        match signals.recv().await {
            Ok(signal) => on_signal(&shared, signal).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                shared.journal.record(
                    Level::Warn,
                    "engine signals lagged",
                    &[("skipped", skipped.to_string())],
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn on_signal(shared: &Shared, signal: EngineSignal) {
    let Some(job_id) = shared.table().job_of(signal.handle()) else {
        log::debug!("signal for unknown engine handle {}", signal.handle());
        return;
    };

    match signal {
        EngineSignal::Download {
            downloaded, total, speed, ..
        } => {
            let report = Progress::from_counts(downloaded, total, Some(speed));
            let updated = shared.table().update(&job_id, |job| {
                job.progress = if job.status == JobStatus::Active {
                    job.progress.advance(report)
                } else {
                    report
                };
            });
            if let Some(job) = updated {
                shared.hub.emit(JobEvent::Progress(job.clone(), job.progress));
            }
        }
        EngineSignal::Done { .. } => {
            let updated = shared.table().update(&job_id, |job| {
                let total = job.progress.total_bytes.max(job.progress.bytes_downloaded);
                job.progress = Progress::from_counts(total, total, None);
                job.progress.percent = 100;
                job.status = JobStatus::Completed;
            });
            let Some(job) = updated else {
                return;
            };
            if let Err(e) = shared.storage.finalize(&job).await {
                shared.journal.record(
                    Level::Warn,
                    "moving completed data failed",
                    &[("job", job_id.clone()), ("error", e.to_string())],
                );
            }
            shared
                .journal
                .record(Level::Info, "job completed", &[("job", job_id.clone())]);
            shared.hub.emit(JobEvent::Completed(job));
        }
        EngineSignal::Error { message, .. } => {
            let updated = shared.table().update(&job_id, |job| {
                job.status = JobStatus::Failed;
                job.error_state = Some(message.clone());
            });
            let Some(job) = updated else {
                return;
            };
            shared.journal.record(
                Level::Error,
                "job failed",
                &[("job", job_id.clone()), ("error", message.clone())],
            );
            shared.hub.emit(JobEvent::Error(message, job.clone()));

            if let Err(e) = shared.storage.remove_partial(&job).await {
                shared.journal.record(
                    Level::Warn,
                    "partial data cleanup failed",
                    &[("job", job_id), ("error", e.to_string())],
                );
            }
        }
    }
}
