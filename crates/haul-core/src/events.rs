//! Job lifecycle events and the fan-out hub every downloader composes.

use async_channel::{Receiver, Sender};
use std::sync::Mutex;

use crate::types::{DownloadJob, JobStatus, Progress};

/// Events pushed to subscribers. Each carries the job snapshot taken right
/// after the change it reports.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started(DownloadJob),
    Progress(DownloadJob, Progress),
    Completed(DownloadJob),
    Paused(DownloadJob),
    Resumed(DownloadJob),
    Canceled(DownloadJob),
    Error(String, DownloadJob),
}

impl JobEvent {
    pub fn job(&self) -> &DownloadJob {
        match self {
            JobEvent::Started(job)
            | JobEvent::Progress(job, _)
            | JobEvent::Completed(job)
            | JobEvent::Paused(job)
            | JobEvent::Resumed(job)
            | JobEvent::Canceled(job)
            | JobEvent::Error(_, job) => job,
        }
    }

    /// Short event name, used in journal entries
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Started(_) => "started",
            JobEvent::Progress(..) => "progress",
            JobEvent::Completed(_) => "completed",
            JobEvent::Paused(_) => "paused",
            JobEvent::Resumed(_) => "resumed",
            JobEvent::Canceled(_) => "canceled",
            JobEvent::Error(..) => "error",
        }
    }

    /// Lifecycle event for a status change observed during reconciliation.
    /// Returns `None` when the change is not a reportable edge.
    pub fn for_transition(previous: JobStatus, job: &DownloadJob) -> Option<JobEvent> {
        if previous == job.status {
            return None;
        }
        match job.status {
            JobStatus::Paused => Some(JobEvent::Paused(job.clone())),
            JobStatus::Active if previous == JobStatus::Paused => Some(JobEvent::Resumed(job.clone())),
            JobStatus::Completed => Some(JobEvent::Completed(job.clone())),
            JobStatus::Canceled => Some(JobEvent::Canceled(job.clone())),
            JobStatus::Failed => Some(JobEvent::Error(
                job.error_state.clone().unwrap_or_else(|| "download failed".to_string()),
                job.clone(),
            )),
            JobStatus::Active | JobStatus::Queued => None,
        }
    }
}

/// Fan-out of [`JobEvent`]s to any number of subscribers
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<JobEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = async_channel::unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned
    pub fn emit(&self, event: JobEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    /// Drop every subscription. Receivers still drain what was already
    /// delivered, then see the stream end.
    pub fn close(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceType;

    fn job(status: JobStatus) -> DownloadJob {
        let mut job = DownloadJob::with_id("j1", SourceType::Http, "https://example.com/a.mkv");
        job.status = status;
        job
    }

    #[test]
    fn test_fan_out_and_prune() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        drop(b);

        hub.emit(JobEvent::Started(job(JobStatus::Active)));

        assert_eq!(hub.subscriber_count(), 1);
        assert!(matches!(a.try_recv(), Ok(JobEvent::Started(_))));
    }

    #[test]
    fn test_close_ends_stream_after_delivered_events() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        hub.emit(JobEvent::Completed(job(JobStatus::Completed)));

        hub.close();

        assert_eq!(hub.subscriber_count(), 0);
        assert!(matches!(rx.try_recv(), Ok(JobEvent::Completed(_))));
        assert!(rx.try_recv().is_err());
        assert!(rx.is_closed());
    }

    #[test]
    fn test_transition_edges() {
        assert!(JobEvent::for_transition(JobStatus::Active, &job(JobStatus::Active)).is_none());
        assert!(JobEvent::for_transition(JobStatus::Queued, &job(JobStatus::Active)).is_none());
        assert!(matches!(
            JobEvent::for_transition(JobStatus::Paused, &job(JobStatus::Active)),
            Some(JobEvent::Resumed(_))
        ));
        assert!(matches!(
            JobEvent::for_transition(JobStatus::Active, &job(JobStatus::Completed)),
            Some(JobEvent::Completed(_))
        ));

        let mut failed = job(JobStatus::Failed);
        failed.error_state = Some("[1] unknown error".to_string());
        match JobEvent::for_transition(JobStatus::Active, &failed) {
            Some(JobEvent::Error(message, _)) => assert_eq!(message, "[1] unknown error"),
            other => panic!("expected error event, got {:?}", other),
        }
    }
}
