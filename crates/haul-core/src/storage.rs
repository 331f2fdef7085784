//! Storage collaborator
//!
//! Knows where media lands and where in-flight partial data lives, so a
//! backend can clean up after a transfer it abandons.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::DownloadJob;

const PARTIAL_DIR: &str = ".partial";

#[async_trait]
pub trait Storage: Send + Sync {
    fn media_root(&self) -> PathBuf;

    /// Directory holding the job's in-flight data
    fn partial_path(&self, job: &DownloadJob) -> PathBuf;

    /// Bytes currently on disk for the job's partial data
    async fn partial_size(&self, job: &DownloadJob) -> Result<u64>;

    async fn remove_partial(&self, job: &DownloadJob) -> Result<()>;

    /// Move a finished job's data out of its partial directory into the
    /// media root
    async fn finalize(&self, job: &DownloadJob) -> Result<()>;
}

/// Filesystem storage rooted at a media directory
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Storage for FsStorage {
    fn media_root(&self) -> PathBuf {
        self.root.clone()
    }

    fn partial_path(&self, job: &DownloadJob) -> PathBuf {
        self.root.join(PARTIAL_DIR).join(&job.id)
    }

    async fn partial_size(&self, job: &DownloadJob) -> Result<u64> {
        let path = self.partial_path(job);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(0);
        }
        dir_size(&path).await
    }

    async fn remove_partial(&self, job: &DownloadJob) -> Result<()> {
        let path = self.partial_path(job);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize(&self, job: &DownloadJob) -> Result<()> {
        let path = self.partial_path(job);
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            tokio::fs::rename(entry.path(), self.root.join(entry.file_name())).await?;
        }
        tokio::fs::remove_dir(&path).await?;
        Ok(())
    }
}

async fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
