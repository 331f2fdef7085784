//! haul - headless runner for the haul download-job orchestrator

mod cli;

use clap::Parser;
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;

use cli::{Args, Backend, Command};
use haul_core::{
    format_bytes, format_eta, format_speed, init_database, settings_to_engine_config, Database, DownloadJob,
    Downloader, EmbeddedEngineDownloader, ExternalDaemonDownloader, FsStorage, GoshEngine, JobEvent, Journal,
    JsonResumeStore, LogJournal, ResumePersistence, ResumeStore, ResumeTracker, Settings, SettingsDb, SourceType,
    SqliteResumeStore,
};

type Persistence = ResumePersistence<Arc<dyn ResumeStore>>;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    log::debug!("Starting haul v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let db = match init_database() {
        Ok(db) => Some(db),
        Err(e) => {
            log::error!("Failed to initialize database: {}", e);
            None
        }
    };

    let settings = load_settings(db.as_ref());
    let persistence = Arc::new(ResumePersistence::new(resume_store(db)));

    match run(args.command, settings, persistence).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Stored settings, persisting the defaults on first run so the generated
/// RPC secret stays stable
fn load_settings(db: Option<&Database>) -> Settings {
    let Some(db) = db else {
        return Settings::default();
    };

    let settings = SettingsDb::load(db).unwrap_or_default();
    if matches!(SettingsDb::get(db, "rpc_secret"), Ok(None)) {
        if let Err(e) = SettingsDb::save(db, &settings) {
            log::warn!("Failed to save default settings: {}", e);
        }
    }
    settings
}

fn resume_store(db: Option<Database>) -> Arc<dyn ResumeStore> {
    match db {
        Some(db) => Arc::new(SqliteResumeStore::new(db)),
        None => Arc::new(JsonResumeStore::new(JsonResumeStore::default_path())),
    }
}

async fn run(command: Command, settings: Settings, persistence: Arc<Persistence>) -> haul_core::Result<()> {
    let journal: Arc<dyn Journal> = Arc::new(LogJournal);

    match command {
        Command::Get { ref urn, backend, .. } => {
            let mut job = DownloadJob::new(SourceType::detect(urn), urn.clone());
            job.file_selection = command.selection();
            let downloader = build_backend(backend, &settings, journal.clone()).await?;
            run_jobs(downloader, vec![job], persistence, journal).await
        }
        Command::Files { urn } => {
            let downloader =
                ExternalDaemonDownloader::new(settings.daemon_config(), settings.retry_policy(), journal)?;
            let listed = downloader.list_files(&urn).await;
            downloader.shutdown().await?;

            for file in listed? {
                println!("{:>4}  {:>10}  {}", file.index, format_bytes(file.size), file.path);
            }
            Ok(())
        }
        Command::Resume { backend } => {
            let jobs: Vec<DownloadJob> = persistence
                .load_incomplete_downloads()
                .await?
                .iter()
                .map(|record| record.to_job())
                .collect();
            if jobs.is_empty() {
                println!("Nothing to resume");
                return Ok(());
            }
            let downloader = build_backend(backend, &settings, journal.clone()).await?;
            run_jobs(downloader, jobs, persistence, journal).await
        }
        Command::Cleanup { max_age_days } => {
            let max_age = max_age_days.unwrap_or(settings.resume_max_age_days);
            let removed = persistence.cleanup_stale_data(max_age).await?;
            println!("Removed {} resume entries older than {} days", removed, max_age);
            Ok(())
        }
    }
}

async fn build_backend(
    backend: Backend,
    settings: &Settings,
    journal: Arc<dyn Journal>,
) -> haul_core::Result<Arc<dyn Downloader>> {
    match backend {
        Backend::Embedded => {
            let engine = GoshEngine::new(settings_to_engine_config(settings)).await?;
            let storage = FsStorage::new(&settings.download_path);
            Ok(Arc::new(EmbeddedEngineDownloader::new(
                Arc::new(engine),
                Arc::new(storage),
                settings.retry_policy(),
                journal,
            )))
        }
        Backend::Daemon => {
            let downloader =
                ExternalDaemonDownloader::new(settings.daemon_config(), settings.retry_policy(), journal)?;
            downloader.init().await?;
            Ok(Arc::new(downloader))
        }
    }
}

/// Start `jobs` and print their events until every one of them finishes or
/// the user interrupts. Interrupted jobs keep their resume entries.
async fn run_jobs(
    downloader: Arc<dyn Downloader>,
    jobs: Vec<DownloadJob>,
    persistence: Arc<Persistence>,
    journal: Arc<dyn Journal>,
) -> haul_core::Result<()> {
    let events = downloader.subscribe();
    let tracker = ResumeTracker::spawn(persistence.clone(), downloader.subscribe(), journal);

    let mut pending = HashSet::new();
    for job in jobs {
        let id = job.id.clone();
        match downloader.start(job).await {
            Ok(started) => {
                println!("Started {} via {} ({})", short_id(&id), downloader.name(), started.source_urn);
                pending.insert(id);
            }
            Err(e) => log::error!("Failed to start {}: {}", short_id(&id), e),
        }
    }

    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else {
                    break;
                };
                print_event(&event);
                if matches!(event, JobEvent::Completed(_) | JobEvent::Canceled(_) | JobEvent::Error(..)) {
                    pending.remove(&event.job().id);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, {} job(s) left for `haul resume`", pending.len());
                break;
            }
        }
    }

    // Shutdown ends the event stream, so the tracker saves every event
    // delivered so far before it finishes
    let shutdown = downloader.shutdown().await;
    drop(downloader);
    tracker.join().await;
    shutdown
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_event(event: &JobEvent) {
    let job = event.job();
    let id = short_id(&job.id);
    match event {
        JobEvent::Progress(_, progress) => {
            let speed = progress.speed.unwrap_or(0);
            let remaining = progress.total_bytes.saturating_sub(progress.bytes_downloaded);
            println!(
                "{}  {:>3}%  {} / {}  {}  ETA {}",
                id,
                progress.percent,
                format_bytes(progress.bytes_downloaded),
                format_bytes(progress.total_bytes),
                format_speed(speed),
                format_eta(remaining, speed)
            );
        }
        JobEvent::Error(message, _) => println!("{}  failed: {}", id, message),
        other => println!("{}  {}", id, other.name()),
    }
}
