//! Resume bookkeeping fed by a live event stream.

use std::sync::Arc;
use std::time::Duration;

use haul_core::{
    DownloadJob, Downloader, FileSelection, JobEvent, JobStatus, JsonResumeStore, MemoryDownloader, MemoryJournal,
    ResumePersistence, ResumeTracker, SourceType,
};
use tempfile::TempDir;

fn magnet(id: &str) -> DownloadJob {
    DownloadJob::with_id(id, SourceType::Torrent, format!("magnet:?xt=urn:btih:{}", id))
}

#[tokio::test]
async fn only_interrupted_jobs_survive() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(ResumePersistence::new(JsonResumeStore::new(dir.path().join("resume.json"))));
    let journal = MemoryJournal::new();
    let downloader = MemoryDownloader::default();
    let tracker = ResumeTracker::spawn(persistence.clone(), downloader.subscribe(), Arc::new(journal.clone()));

    downloader.start(magnet("done")).await.unwrap();
    downloader
        .start(magnet("parked").with_selection(FileSelection::indices([1])))
        .await
        .unwrap();
    downloader.start(magnet("dropped")).await.unwrap();

    downloader.report_progress("parked", 40, 100).unwrap();
    downloader.pause("parked").await.unwrap();
    downloader.report_progress("done", 50, 100).unwrap();
    downloader.complete("done").unwrap();
    downloader.cancel("dropped").await.unwrap();

    // Closing the event stream lets the tracker drain and finish
    drop(downloader);
    tracker.join().await;

    let records = persistence.load_incomplete_downloads().await.unwrap();
    assert_eq!(records.len(), 1);
    let parked = &records[0];
    assert_eq!(parked.id, "parked");
    assert_eq!(parked.status, JobStatus::Paused);
    assert_eq!(parked.progress.percent, 40);
    assert_eq!(parked.file_selection, Some(FileSelection::indices([1])));
    assert!(journal.matching("failed to save resume state").is_empty());

    // A new process picks the job up where it left off
    let reopened = ResumePersistence::new(JsonResumeStore::new(dir.path().join("resume.json")));
    let job = reopened.get_resume_data("parked").await.unwrap().unwrap().to_job();
    assert_eq!(job.status, JobStatus::Queued);

    let downloader = MemoryDownloader::default();
    let restarted = downloader.start(job).await.unwrap();
    assert_eq!(restarted.id, "parked");
    assert_eq!(restarted.status, JobStatus::Active);
}

#[tokio::test]
async fn save_failures_are_journaled() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let persistence = Arc::new(ResumePersistence::new(JsonResumeStore::new(blocker.join("resume.json"))));
    let journal = MemoryJournal::new();
    let downloader = MemoryDownloader::default();
    let tracker = ResumeTracker::spawn(persistence, downloader.subscribe(), Arc::new(journal.clone()));

    downloader.start(magnet("a")).await.unwrap();
    drop(downloader);
    tracker.join().await;

    let failures = journal.matching("failed to save resume state");
    assert_eq!(failures.len(), 1);
    assert!(failures[0].context.contains(&("event".to_string(), "started".to_string())));
}

#[tokio::test]
async fn completion_is_saved_before_runner_exits() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(ResumePersistence::new(JsonResumeStore::new(dir.path().join("resume.json"))));
    let downloader = Arc::new(MemoryDownloader::default());
    let events = downloader.subscribe();
    let tracker = ResumeTracker::spawn(persistence.clone(), downloader.subscribe(), Arc::new(MemoryJournal::new()));
    downloader.start(magnet("x")).await.unwrap();

    // Let the Active state reach the store first
    tokio::time::timeout(Duration::from_secs(2), async {
        while persistence.get_resume_data("x").await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    downloader.report_progress("x", 400, 1000).unwrap();
    downloader.complete("x").unwrap();
    while let Ok(event) = events.recv().await {
        if matches!(event, JobEvent::Completed(_)) {
            break;
        }
    }

    // A runner stops as soon as its own subscription reports the end
    downloader.shutdown().await.unwrap();
    drop(downloader);
    tokio::time::timeout(Duration::from_secs(2), tracker.join()).await.unwrap();

    assert!(persistence.load_incomplete_downloads().await.unwrap().is_empty());
}

#[tokio::test]
async fn byte_progress_within_a_percent_is_saved_once_due() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(ResumePersistence::new(JsonResumeStore::new(dir.path().join("resume.json"))));
    let downloader = MemoryDownloader::default();
    let tracker = ResumeTracker::spawn_with_interval(
        persistence.clone(),
        downloader.subscribe(),
        Arc::new(MemoryJournal::new()),
        Duration::ZERO,
    );

    downloader.start(magnet("big")).await.unwrap();
    downloader.report_progress("big", 10_000, 1_000_000).unwrap();
    downloader.report_progress("big", 10_500, 1_000_000).unwrap();
    downloader.shutdown().await.unwrap();
    tracker.join().await;

    let record = persistence.get_resume_data("big").await.unwrap().unwrap();
    assert_eq!(record.progress.percent, 1);
    assert_eq!(record.progress.bytes_downloaded, 10_500);
}

#[tokio::test]
async fn byte_progress_within_a_percent_waits_for_interval() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(ResumePersistence::new(JsonResumeStore::new(dir.path().join("resume.json"))));
    let downloader = MemoryDownloader::default();
    let tracker = ResumeTracker::spawn_with_interval(
        persistence.clone(),
        downloader.subscribe(),
        Arc::new(MemoryJournal::new()),
        Duration::from_secs(3600),
    );

    downloader.start(magnet("big")).await.unwrap();
    downloader.report_progress("big", 10_000, 1_000_000).unwrap();
    downloader.report_progress("big", 10_500, 1_000_000).unwrap();
    downloader.shutdown().await.unwrap();
    tracker.join().await;

    let record = persistence.get_resume_data("big").await.unwrap().unwrap();
    assert_eq!(record.progress.bytes_downloaded, 10_000);
}
