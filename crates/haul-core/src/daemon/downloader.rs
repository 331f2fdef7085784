//! [`Downloader`] over the external daemon.

use async_channel::Receiver;
use async_trait::async_trait;
use log::Level;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::rpc::RpcClient;
use super::status::{DaemonState, MANIFEST_KEYS};
use super::supervisor::ProcessSupervisor;
use super::{poller, DaemonConfig};
use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::events::{EventHub, JobEvent};
use crate::journal::Journal;
use crate::registry::JobTable;
use crate::retry::RetryPolicy;
use crate::selection;
use crate::types::{DownloadJob, FileEntry, JobStatus, SourceType};

/// State the downloader and its poller both reach into
pub(super) struct Shared {
    pub(super) rpc: RpcClient,
    pub(super) table: Mutex<JobTable>,
    pub(super) hub: EventHub,
    pub(super) journal: Arc<dyn Journal>,
}

impl Shared {
    /// The job table. Never hold the guard across an await.
    pub(super) fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ExternalDaemonDownloader {
    shared: Arc<Shared>,
    config: DaemonConfig,
    retry: RetryPolicy,
    supervisor: Option<ProcessSupervisor>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ExternalDaemonDownloader {
    /// Downloader that launches and supervises its own daemon process
    pub fn new(config: DaemonConfig, retry: RetryPolicy, journal: Arc<dyn Journal>) -> Result<Self> {
        config.validate()?;
        let rpc = config.rpc_client()?;
        let supervisor = ProcessSupervisor::new(config.clone(), rpc.clone(), journal.clone());
        Ok(Self::build(config, retry, journal, rpc, Some(supervisor)))
    }

    /// Downloader for a daemon that is already running and managed elsewhere
    pub fn attach(config: DaemonConfig, retry: RetryPolicy, journal: Arc<dyn Journal>) -> Result<Self> {
        config.validate()?;
        let rpc = config.rpc_client()?;
        Ok(Self::build(config, retry, journal, rpc, None))
    }

    fn build(
        config: DaemonConfig,
        retry: RetryPolicy,
        journal: Arc<dyn Journal>,
        rpc: RpcClient,
        supervisor: Option<ProcessSupervisor>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                rpc,
                table: Mutex::new(JobTable::new()),
                hub: EventHub::new(),
                journal,
            }),
            config,
            retry,
            supervisor,
            poller: Mutex::new(None),
        }
    }

    pub fn supervisor(&self) -> Option<&ProcessSupervisor> {
        self.supervisor.as_ref()
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.shared.rpc
    }

    /// Bring the daemon up and start reconciling. Safe to call repeatedly.
    pub async fn init(&self) -> Result<()> {
        if let Some(supervisor) = &self.supervisor {
            supervisor.init().await?;
        }

        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_none() {
            *poller = Some(poller::spawn(self.shared.clone(), self.config.poll_interval));
        }
        Ok(())
    }

    /// Run one reconciliation pass right away
    pub async fn reconcile_now(&self) {
        poller::reconcile_tick(self.shared.clone()).await;
    }

    /// Enumerate the files of a torrent source without downloading it.
    /// Returned indices are 0-based.
    pub async fn list_files(&self, source_urn: &str) -> Result<Vec<FileEntry>> {
        let source_type = SourceType::detect(source_urn);
        if source_type != SourceType::Torrent {
            return Err(Error::UnsupportedSourceType(source_type));
        }
        self.init().await?;

        let mut options = Map::new();
        options.insert("dir".to_string(), Value::from(self.config.download_dir.clone()));
        options.insert("bt-metadata-only".to_string(), Value::from("true"));
        options.insert("bt-save-metadata".to_string(), Value::from("false"));

        let rpc = &self.shared.rpc;
        let gid = rpc.add_uri(&[source_urn.to_string()], &options).await?;
        let mut lookups = vec![gid];

        let result = self.await_manifest(&mut lookups).await;

        for gid in &lookups {
            if let Err(e) = rpc.force_remove(gid).await {
                log::debug!("metadata lookup {} cleanup: {}", gid, e);
            }
        }

        result
    }

    /// Poll the newest lookup until the daemon reports real file metadata.
    /// Follow-up downloads the daemon spawns (magnets) are appended to
    /// `lookups` so the caller can remove them.
    async fn await_manifest(&self, lookups: &mut Vec<String>) -> Result<Vec<FileEntry>> {
        let rpc = &self.shared.rpc;

        for _ in 0..self.config.manifest_attempts {
            let Some(current) = lookups.last().cloned() else {
                break;
            };
            let status = rpc.tell_status(&current, MANIFEST_KEYS).await?;

            if let Some(files) = status.manifest() {
                return Ok(files);
            }
            if let Some(next) = status.followed_by.first() {
                if !lookups.contains(next) {
                    lookups.push(next.clone());
                    continue;
                }
            }
            if status.status == DaemonState::Error {
                return Err(Error::Protocol(status.diagnostic()));
            }

            sleep(self.config.manifest_interval).await;
        }

        Err(Error::Transport(format!(
            "no file metadata after {} attempts",
            self.config.manifest_attempts
        )))
    }

    /// 0-based indices to fetch, resolving patterns against a metadata lookup
    async fn selected_indices(&self, job: &DownloadJob) -> Result<Vec<usize>> {
        let Some(selection) = job.file_selection.as_ref().filter(|s| !s.is_empty()) else {
            return Ok(Vec::new());
        };
        if !selection.needs_manifest() {
            let mut indices = selection.file_indices.clone();
            indices.sort_unstable();
            indices.dedup();
            return Ok(indices);
        }

        let files = self.list_files(&job.source_urn).await?;
        let indices = selection::resolve(selection, &files)?;
        if indices.is_empty() {
            return Err(Error::InvalidState(format!(
                "selection matches none of the {} files in {}",
                files.len(),
                job.source_urn
            )));
        }
        Ok(indices)
    }

    fn handle(&self, id: &str) -> Result<String> {
        self.shared
            .table()
            .handle_of(id)
            .ok_or_else(|| Error::InvalidState(format!("job {} has no daemon handle", id)))
    }

    /// Record a local status change and report it
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
impl Downloader for ExternalDaemonDownloader {
    fn name(&self) -> &'static str {
        "daemon"
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
        self.init().await?;

        let mut options = Map::new();
        options.insert("dir".to_string(), Value::from(self.config.download_dir.clone()));
        let indices = self.selected_indices(&job).await?;
        if !indices.is_empty() {
            options.insert("select-file".to_string(), Value::from(selection::to_wire_indices(&indices)));
        }

        let uris = vec![job.source_urn.clone()];
        let rpc = &self.shared.rpc;
        let journal = &self.shared.journal;
        let gid = self
            .retry
            .run_with(
                || rpc.add_uri(&uris, &options),
                |attempt, err, delay| {
                    journal.record(
                        Level::Warn,
                        "retrying addUri",
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
        let inserted = self.shared.table().insert(job.clone(), &gid);
        if let Err(e) = inserted {
            let _ = rpc.force_remove(&gid).await;
            return Err(e);
        }

        journal.record(
            Level::Info,
            "job started",
            &[("job", job.id.clone()), ("gid", gid), ("source", job.source_urn.clone())],
        );
        self.shared.hub.emit(JobEvent::Started(job.clone()));
        Ok(job)
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let job = self.shared.table().live(id)?;
        if job.status != JobStatus::Active {
            return Err(Error::InvalidState(format!("cannot pause job {} while {}", id, job.status)));
        }
        let gid = self.handle(id)?;
        self.shared.rpc.pause(&gid).await?;

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
        let gid = self.handle(id)?;
        self.shared.rpc.unpause(&gid).await?;

        if let Some(job) = self.transition(id, JobStatus::Active) {
            self.shared.hub.emit(JobEvent::Resumed(job));
        }
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let (_, gid) = {
            let table = self.shared.table();
            (table.live(id)?, table.handle_of(id))
        };

        if let Some(gid) = gid {
            let rpc = &self.shared.rpc;
            if let Err(e) = rpc.remove(&gid).await {
                self.shared.journal.record(
                    Level::Warn,
                    "remove failed, forcing",
                    &[("job", id.to_string()), ("error", e.to_string())],
                );
                if let Err(e) = rpc.force_remove(&gid).await {
                    self.shared.journal.record(
                        Level::Warn,
                        "forced remove failed",
                        &[("job", id.to_string()), ("error", e.to_string())],
                    );
                }
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
        let poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = poller {
            task.abort();
        }
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await?;
        }
        self.shared.hub.close();
        Ok(())
    }
}
