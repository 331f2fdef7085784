//! Engine Adapter
//!
//! The embedded backend talks to its in-process engine through
//! [`TransferEngine`]. [`GoshEngine`] adapts the gosh-dl download engine to
//! it; tests substitute their own implementation.

use async_trait::async_trait;
use gosh_dl::{DownloadEngine, DownloadEvent, DownloadId, DownloadOptions, EngineConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::types::{Settings, SourceType};

/// Signal capacity before slow listeners start lagging
const SIGNAL_CAPACITY: usize = 256;

/// Everything the engine needs to begin a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    pub source_type: SourceType,
    pub source_urn: String,
    pub save_dir: PathBuf,
    /// 0-based, empty means every file
    pub selected_files: Vec<usize>,
}

/// Engine-side transfer notifications, keyed by engine handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSignal {
    Download {
        handle: String,
        downloaded: u64,
        total: u64,
        speed: u64,
    },
    Done {
        handle: String,
    },
    Error {
        handle: String,
        message: String,
    },
}

impl EngineSignal {
    pub fn handle(&self) -> &str {
        match self {
            EngineSignal::Download { handle, .. }
            | EngineSignal::Done { handle }
            | EngineSignal::Error { handle, .. } => handle,
        }
    }
}

/// An in-process transfer engine
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Begin a transfer, returning the engine's handle for it
    async fn add(&self, request: &EngineRequest) -> Result<String>;

    async fn pause(&self, handle: &str) -> Result<()>;

    async fn resume(&self, handle: &str) -> Result<()>;

    /// Drop the transfer, deleting its data when `delete_data` is set
    async fn destroy(&self, handle: &str, delete_data: bool) -> Result<()>;

    fn signals(&self) -> broadcast::Receiver<EngineSignal>;
}

/// [`TransferEngine`] over gosh-dl
pub struct GoshEngine {
    engine: Arc<DownloadEngine>,
    http: reqwest::Client,
    signals: broadcast::Sender<EngineSignal>,
    forwarder: JoinHandle<()>,
}

impl GoshEngine {
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let engine = DownloadEngine::new(config).await?;
        Ok(Self::from_engine(engine))
    }

    /// Wrap an engine that is already running. Must be called from within a
    /// Tokio runtime.
    pub fn from_engine(engine: Arc<DownloadEngine>) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let forwarder = tokio::spawn(forward_events(engine.clone(), signals.clone()));
        Self {
            engine,
            http: reqwest::Client::new(),
            signals,
            forwarder,
        }
    }

    pub fn engine(&self) -> &Arc<DownloadEngine> {
        &self.engine
    }

    /// Raw `.torrent` bytes from a URL or a local path
    async fn torrent_bytes(&self, urn: &str) -> Result<Vec<u8>> {
        if urn.starts_with("http://") || urn.starts_with("https://") {
            let response = self
                .http
                .get(urn)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::Transport(e.to_string()))?;
            let bytes = response.bytes().await.map_err(|e| Error::Transport(e.to_string()))?;
            return Ok(bytes.to_vec());
        }
        let path = urn.strip_prefix("file://").unwrap_or(urn);
        Ok(tokio::fs::read(path).await?)
    }
}

impl Drop for GoshEngine {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[async_trait]
impl TransferEngine for GoshEngine {
    async fn add(&self, request: &EngineRequest) -> Result<String> {
        let options = DownloadOptions {
            save_dir: Some(request.save_dir.clone()),
            selected_files: (!request.selected_files.is_empty()).then(|| request.selected_files.clone()),
            ..Default::default()
        };

        let urn = request.source_urn.as_str();
        let id = match request.source_type {
            SourceType::Torrent if urn.starts_with("magnet:") => self.engine.add_magnet(urn, options).await?,
            SourceType::Torrent => {
                let data = self.torrent_bytes(urn).await?;
                self.engine.add_torrent(&data, options).await?
            }
            SourceType::Http => self.engine.add_http(urn, options).await?,
            other => return Err(Error::UnsupportedSourceType(other)),
        };
        Ok(id.as_uuid().to_string())
    }

    async fn pause(&self, handle: &str) -> Result<()> {
        let id = parse_gid(handle)?;
        Ok(self.engine.pause(id).await?)
    }

    async fn resume(&self, handle: &str) -> Result<()> {
        let id = parse_gid(handle)?;
        Ok(self.engine.resume(id).await?)
    }

    async fn destroy(&self, handle: &str, delete_data: bool) -> Result<()> {
        let id = parse_gid(handle)?;
        Ok(self.engine.cancel(id, delete_data).await?)
    }

    fn signals(&self) -> broadcast::Receiver<EngineSignal> {
        self.signals.subscribe()
    }
}

/// Translate engine events into [`EngineSignal`]s until the engine goes away
async fn forward_events(engine: Arc<DownloadEngine>, signals: broadcast::Sender<EngineSignal>) {
    let mut events = engine.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("engine event stream lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let signal = match event {
            DownloadEvent::Progress { id, .. } => match engine.status(id) {
                Some(status) => EngineSignal::Download {
                    handle: id.as_uuid().to_string(),
                    downloaded: status.progress.completed_size,
                    total: status.progress.total_size.unwrap_or(0),
                    speed: status.progress.download_speed,
                },
                None => continue,
            },
            DownloadEvent::Completed { id } => EngineSignal::Done {
                handle: id.as_uuid().to_string(),
            },
            DownloadEvent::Failed { id, error, .. } => EngineSignal::Error {
                handle: id.as_uuid().to_string(),
                message: error.to_string(),
            },
            _ => continue,
        };

        // No receivers is fine, nobody is listening yet
        let _ = signals.send(signal);
    }
    log::debug!("engine event stream closed");
}

/// Parse a handle string to a DownloadId
fn parse_gid(gid: &str) -> Result<DownloadId> {
    if let Ok(uuid) = uuid::Uuid::parse_str(gid) {
        return Ok(DownloadId::from_uuid(uuid));
    }
    DownloadId::from_gid(gid).ok_or_else(|| Error::NotFound(format!("invalid engine handle: {}", gid)))
}

/// Convert settings to engine configuration
pub fn settings_to_engine_config(settings: &Settings) -> EngineConfig {
    let download_dir = PathBuf::from(&settings.download_path);

    if !download_dir.exists() {
        if let Err(e) = std::fs::create_dir_all(&download_dir) {
            log::warn!("Failed to create download directory {:?}: {}", download_dir, e);
        }
    }

    // Engine session state sits next to the application database
    let database_path = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("haul")
        .join("engine.db");
    if let Some(parent) = database_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    EngineConfig {
        download_dir,
        max_concurrent_downloads: settings.max_concurrent_downloads as usize,
        global_download_limit: (settings.download_speed_limit > 0).then_some(settings.download_speed_limit),
        global_upload_limit: (settings.upload_speed_limit > 0).then_some(settings.upload_speed_limit),
        enable_dht: settings.bt_enable_dht,
        enable_pex: settings.bt_enable_pex,
        enable_lpd: settings.bt_enable_lpd,
        max_peers: settings.bt_max_peers as usize,
        seed_ratio: settings.bt_seed_ratio,
        database_path: Some(database_path),
        ..Default::default()
    }
}
