//! Periodic reconciliation of daemon status into the job table.

use log::Level;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use super::downloader::Shared;
use super::rpc::RpcError;
use super::status::STATUS_KEYS;
use crate::events::JobEvent;
use crate::registry::StatusReport;
use crate::types::JobStatus;

/// Run a reconciliation tick every `interval`. A slow tick never delays the
/// next one; ordering between overlapping ticks is settled by the job
/// table's query tickets.
pub(super) fn spawn(shared: Arc<Shared>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    ticks.spawn(reconcile_tick(shared.clone()));
                }
                Some(finished) = ticks.join_next() => {
                    if let Err(e) = finished {
                        log::warn!("reconciliation tick panicked: {}", e);
                    }
                }
            }
        }
    })
}

/// Query every tracked non-terminal job once and fold the answers in
pub(super) async fn reconcile_tick(shared: Arc<Shared>) {
    let targets = shared.table().poll_targets();

    for target in targets {
        let report = match shared.rpc.tell_status(&target.handle, STATUS_KEYS).await {
            Ok(status) => {
                if let Some(next) = status.follow_up() {
                    let rebound = shared.table().rebind(&target.job_id, target.ticket, next);
                    if rebound {
                        shared.journal.record(
                            Level::Info,
                            "job continues under follow-up download",
                            &[
                                ("job", target.job_id.clone()),
                                ("from", target.handle.clone()),
                                ("to", next.to_string()),
                            ],
                        );
                    }
                    continue;
                }
                status.to_report()
            }
            Err(RpcError::Rpc { code, message }) => {
                // The daemon lost track of this handle, e.g. after a relaunch
                let Some(current) = shared.table().get(&target.job_id) else {
                    continue;
                };
                StatusReport {
                    status: JobStatus::Failed,
                    progress: current.progress,
                    error: Some(format!("[{}] {}", code, message)),
                }
            }
            Err(e) => {
                shared.journal.record(
                    Level::Warn,
                    "status query failed",
                    &[("job", target.job_id.clone()), ("error", e.to_string())],
                );
                continue;
            }
        };

        let applied = {
            let mut table = shared.table();
            let applied = table.apply(&target.job_id, target.ticket, report);
            if let Some(ref applied) = applied {
                if applied.job.status == JobStatus::Canceled {
                    table.purge(&target.job_id);
                }
            }
            applied
        };

        let Some(applied) = applied else {
            continue;
        };

        let job = applied.job;
        shared.hub.emit(JobEvent::Progress(job.clone(), job.progress));

        if let Some(event) = JobEvent::for_transition(applied.previous, &job) {
            shared.journal.record(
                Level::Info,
                "job status changed",
                &[
                    ("job", job.id.clone()),
                    ("from", applied.previous.to_string()),
                    ("to", job.status.to_string()),
                ],
            );
            shared.hub.emit(event);
        }
    }
}
