//! Types module - data structures for haul
//!
//! These types define the job model shared by every backend and the
//! settings the orchestrator runs with.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::daemon::DaemonConfig;
use crate::retry::RetryPolicy;

/// Where a job's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    #[default]
    Torrent,
    RemoteStream,
    Http,
    Local,
}

impl SourceType {
    /// Guess the source type from a URN
    pub fn detect(urn: &str) -> Self {
        let lower = urn.trim().to_lowercase();
        if lower.starts_with("magnet:") || lower.ends_with(".torrent") {
            SourceType::Torrent
        } else if lower.ends_with(".m3u8") || lower.ends_with(".mpd") {
            SourceType::RemoteStream
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceType::Http
        } else {
            SourceType::Local
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Torrent => write!(f, "torrent"),
            SourceType::RemoteStream => write!(f, "remote-stream"),
            SourceType::Http => write!(f, "http"),
            SourceType::Local => write!(f, "local"),
        }
    }
}

impl From<&str> for SourceType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "torrent" => SourceType::Torrent,
            "remote-stream" => SourceType::RemoteStream,
            "http" => SourceType::Http,
            _ => SourceType::Local,
        }
    }
}

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Completed, Failed and Canceled accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled)
    }

    /// States worth keeping across a restart
    pub fn is_resumable(self) -> bool {
        matches!(self, JobStatus::Active | JobStatus::Paused)
    }
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "active" => JobStatus::Active,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "canceled" => JobStatus::Canceled,
            _ => JobStatus::Queued,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// Transfer progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    /// Whole percent, always within 0..=100
    pub percent: u8,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    /// Bytes per second, when the backend reports it
    pub speed: Option<u64>,
}

impl Progress {
    /// Build a snapshot from completed/total byte counts
    pub fn from_counts(completed: u64, total: u64, speed: Option<u64>) -> Self {
        Self {
            percent: crate::utils::calculate_percent(completed, total),
            bytes_downloaded: completed,
            total_bytes: total,
            speed,
        }
    }

    /// Fold a newer report into this one without letting byte count or
    /// percent go backwards
    pub fn advance(&self, next: Progress) -> Progress {
        Progress {
            percent: self.percent.max(next.percent),
            bytes_downloaded: self.bytes_downloaded.max(next.bytes_downloaded),
            total_bytes: next.total_bytes,
            speed: next.speed,
        }
    }
}

/// Season/episode pair matched against file names such as `S01E02`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub season: u32,
    pub episode: u32,
}

impl std::str::FromStr for EpisodeRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let rest = upper
            .strip_prefix('S')
            .ok_or_else(|| format!("expected SxxEyy, got {}", s))?;
        let (season, episode) = rest
            .split_once('E')
            .ok_or_else(|| format!("expected SxxEyy, got {}", s))?;
        Ok(Self {
            season: season.parse().map_err(|_| format!("bad season in {}", s))?,
            episode: episode.parse().map_err(|_| format!("bad episode in {}", s))?,
        })
    }
}

/// Partial fetch of a multi-file source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileSelection {
    /// 0-based file indices
    #[serde(default)]
    pub file_indices: Vec<usize>,
    /// Glob patterns matched against file paths
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub episodes: Vec<EpisodeRef>,
}

impl FileSelection {
    pub fn indices(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            file_indices: indices.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Patterns and episodes can only be resolved against a file manifest
    pub fn needs_manifest(&self) -> bool {
        !self.patterns.is_empty() || !self.episodes.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.file_indices.is_empty() && !self.needs_manifest()
    }
}

/// One file of a multi-file source, as reported by a metadata lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// 0-based
    pub index: usize,
    pub path: String,
    pub size: u64,
}

/// Download job model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub source_type: SourceType,
    pub source_urn: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub error_state: Option<String>,
    pub file_selection: Option<FileSelection>,
    pub created_at: String,
}

impl DownloadJob {
    /// New queued job with a fresh id
    pub fn new(source_type: SourceType, source_urn: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), source_type, source_urn)
    }

    pub fn with_id(id: impl Into<String>, source_type: SourceType, source_urn: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_type,
            source_urn: source_urn.into(),
            status: JobStatus::Queued,
            progress: Progress::default(),
            error_state: None,
            file_selection: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_selection(mut self, selection: FileSelection) -> Self {
        self.file_selection = Some(selection);
        self
    }
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub download_path: String,
    pub daemon_binary: String,
    pub rpc_port: u16,
    pub rpc_secret: String,
    pub max_concurrent_downloads: u32,
    pub download_speed_limit: u64,
    pub upload_speed_limit: u64,
    pub check_integrity: bool,
    pub bt_enable_dht: bool,
    pub bt_enable_pex: bool,
    pub bt_enable_lpd: bool,
    pub bt_max_peers: u32,
    pub bt_seed_ratio: f64,
    /// Minutes to seed after completion, 0 disables seeding
    pub bt_seed_time: u32,
    pub poll_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub ready_interval_ms: u64,
    pub ready_attempts: u32,
    pub restart_cooldown_ms: u64,
    pub shutdown_grace_ms: u64,
    pub manifest_interval_ms: u64,
    pub manifest_attempts: u32,
    pub retry_count: u32,
    pub retry_factor: u32,
    pub resume_max_age_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let download_path = dirs::download_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join("Downloads"))
            .to_string_lossy()
            .to_string();

        Self {
            download_path,
            daemon_binary: "aria2c".to_string(),
            rpc_port: 6800,
            rpc_secret: uuid::Uuid::new_v4().simple().to_string(),
            max_concurrent_downloads: 5,
            download_speed_limit: 0,
            upload_speed_limit: 0,
            check_integrity: true,
            bt_enable_dht: true,
            bt_enable_pex: true,
            bt_enable_lpd: true,
            bt_max_peers: 55,
            bt_seed_ratio: 1.0,
            bt_seed_time: 0,
            poll_interval_ms: 1_000,
            rpc_timeout_ms: 10_000,
            ready_interval_ms: 250,
            ready_attempts: 40,
            restart_cooldown_ms: 2_000,
            shutdown_grace_ms: 5_000,
            manifest_interval_ms: 1_000,
            manifest_attempts: 30,
            retry_count: 3,
            retry_factor: 2,
            resume_max_age_days: 30,
        }
    }
}

impl Settings {
    /// Launch and timing configuration for the external daemon
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            binary: self.daemon_binary.clone(),
            rpc_port: self.rpc_port,
            rpc_secret: self.rpc_secret.clone(),
            download_dir: self.download_path.clone(),
            max_concurrent_downloads: self.max_concurrent_downloads,
            max_download_limit: self.download_speed_limit,
            check_integrity: self.check_integrity,
            enable_dht: self.bt_enable_dht,
            seed_time: self.bt_seed_time,
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            ready_interval: Duration::from_millis(self.ready_interval_ms),
            ready_attempts: self.ready_attempts,
            restart_cooldown: Duration::from_millis(self.restart_cooldown_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            manifest_interval: Duration::from_millis(self.manifest_interval_ms),
            manifest_attempts: self.manifest_attempts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, self.retry_factor)
    }
}
