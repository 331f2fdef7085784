//! The capability every transfer backend offers.

use async_channel::Receiver;
use async_trait::async_trait;

use crate::error::Result;
use crate::events::JobEvent;
use crate::types::{DownloadJob, SourceType};

/// Uniform job lifecycle over an interchangeable transfer backend.
///
/// A backend owns each job it accepted until the job reaches a terminal
/// state and is the only thing that changes its status meanwhile. File
/// indices in [`crate::FileSelection`] are always 0-based here.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    fn supports(&self, source_type: SourceType) -> bool;

    /// Hand `job` to the backend. Fails with `UnsupportedSourceType` before
    /// any backend call when the source cannot be handled here. Emits
    /// [`JobEvent::Started`] once the backend accepts.
    async fn start(&self, job: DownloadJob) -> Result<DownloadJob>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn resume(&self, id: &str) -> Result<()>;

    /// Remove the job. Always ends with the job purged, even if the backend
    /// refuses every removal attempt.
    async fn cancel(&self, id: &str) -> Result<()>;

    /// Last known snapshot, never waits on the backend
    async fn get_status(&self, id: &str) -> Option<DownloadJob>;

    async fn jobs(&self) -> Vec<DownloadJob>;

    fn subscribe(&self) -> Receiver<JobEvent>;

    /// Release processes and timers and end every event subscription. Safe
    /// to call more than once.
    async fn shutdown(&self) -> Result<()>;
}
