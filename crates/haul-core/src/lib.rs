//! haul core library
//!
//! Runs download jobs on interchangeable transfer backends: an in-process
//! engine and an external daemon driven over JSON-RPC. Every backend offers
//! the same [`Downloader`] lifecycle and pushes [`JobEvent`]s to subscribers.
//! Resume bookkeeping, settings persistence and the injected logging and
//! storage collaborators live here too. Frontends only wire these together.

pub mod daemon;
pub mod db;
pub mod downloader;
pub mod embedded;
pub mod engine_adapter;
pub mod error;
pub mod events;
pub mod journal;
pub mod memory;
pub mod registry;
pub mod resume;
pub mod retry;
pub mod selection;
pub mod storage;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use daemon::{DaemonConfig, ExternalDaemonDownloader, Phase, ProcessSupervisor, RpcClient, RpcError};
pub use db::{get_db_path, init_database, open_database, open_in_memory, Database, SettingsDb, SqliteResumeStore};
pub use downloader::Downloader;
pub use embedded::EmbeddedEngineDownloader;
pub use engine_adapter::{settings_to_engine_config, EngineRequest, EngineSignal, GoshEngine, TransferEngine};
pub use error::{Error, Result};
pub use events::{EventHub, JobEvent};
pub use journal::{Journal, JournalEntry, LogJournal, MemoryJournal};
pub use memory::MemoryDownloader;
pub use registry::{HandleMap, JobTable};
pub use resume::{JsonResumeStore, ResumePersistence, ResumeRecord, ResumeStore, ResumeTracker};
pub use retry::RetryPolicy;
pub use storage::{FsStorage, Storage};
pub use types::*;
pub use utils::{calculate_percent, format_bytes, format_eta, format_speed};

// Re-export gosh-dl types that frontends might need
pub use gosh_dl::EngineConfig;
