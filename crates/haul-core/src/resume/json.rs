//! Resume records in a single JSON file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{ResumeRecord, ResumeStore};
use crate::error::Result;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ResumeFile {
    version: u32,
    #[serde(default)]
    entries: Vec<ResumeRecord>,
}

/// Rewrites the whole file on every save, via a temp file renamed over the
/// target so a crash never leaves a half-written file behind
#[derive(Debug, Clone)]
pub struct JsonResumeStore {
    path: PathBuf,
}

impl JsonResumeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `resume.json` under the application data directory
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("haul")
            .join("resume.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ResumeStore for JsonResumeStore {
    async fn load_all(&self) -> Result<Vec<ResumeRecord>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: ResumeFile = serde_json::from_slice(&data)?;
        Ok(file.entries)
    }

    async fn replace_all(&self, records: &[ResumeRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = ResumeFile {
            version: FORMAT_VERSION,
            entries: records.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, &data).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}
