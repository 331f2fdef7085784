//! Feeds a downloader's event stream into [`ResumePersistence`].

use async_channel::Receiver;
use log::Level;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{ResumePersistence, ResumeStore};
use crate::events::JobEvent;
use crate::journal::Journal;
use crate::types::Progress;

/// Minimum spacing between saves that only move the byte count
pub const DEFAULT_BYTES_SAVE_INTERVAL: Duration = Duration::from_secs(5);

struct Saved {
    progress: Progress,
    at: Instant,
}

pub struct ResumeTracker {
    task: JoinHandle<()>,
}

impl ResumeTracker {
    /// Save the job snapshot carried by every lifecycle event. Runs until the
    /// event stream closes, which happens when the downloader shuts down.
    pub fn spawn<S>(
        persistence: Arc<ResumePersistence<S>>,
        events: Receiver<JobEvent>,
        journal: Arc<dyn Journal>,
    ) -> Self
    where
        S: ResumeStore + 'static,
    {
        Self::spawn_with_interval(persistence, events, journal, DEFAULT_BYTES_SAVE_INTERVAL)
    }

    /// Like [`spawn`](Self::spawn). Progress events are saved whenever the
    /// whole percent moves, and otherwise when the byte count moved and at
    /// least `bytes_interval` passed since the job was last saved.
    pub fn spawn_with_interval<S>(
        persistence: Arc<ResumePersistence<S>>,
        events: Receiver<JobEvent>,
        journal: Arc<dyn Journal>,
        bytes_interval: Duration,
    ) -> Self
    where
        S: ResumeStore + 'static,
    {
        let task = tokio::spawn(async move {
            let mut saved: HashMap<String, Saved> = HashMap::new();

            while let Ok(event) = events.recv().await {
                let job = event.job();
                if let JobEvent::Progress(_, progress) = &event {
                    if let Some(last) = saved.get(&job.id) {
                        let percent_moved = last.progress.percent != progress.percent;
                        let bytes_due = last.progress.bytes_downloaded != progress.bytes_downloaded
                            && last.at.elapsed() >= bytes_interval;
                        if !percent_moved && !bytes_due {
                            continue;
                        }
                    }
                }

                match persistence.save_download_state(job).await {
                    Ok(()) => {
                        if job.status.is_resumable() {
                            saved.insert(
                                job.id.clone(),
                                Saved {
                                    progress: job.progress,
                                    at: Instant::now(),
                                },
                            );
                        } else {
                            saved.remove(&job.id);
                        }
                    }
                    Err(e) => journal.record(
                        Level::Warn,
                        "failed to save resume state",
                        &[
                            ("job", job.id.clone()),
                            ("event", event.name().to_string()),
                            ("error", e.to_string()),
                        ],
                    ),
                }
            }
        });

        Self { task }
    }

    /// Wait for the event stream to close and the last save to finish
    pub async fn join(self) {
        let _ = self.task.await;
    }
}
