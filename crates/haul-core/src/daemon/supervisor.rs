//! Launches the daemon, waits for it to answer, and relaunches it after an
//! unexpected exit.

use log::Level;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::rpc::RpcClient;
use super::DaemonConfig;
use crate::error::{Error, Result};
use crate::journal::Journal;

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Monitor {
    kill: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    config: DaemonConfig,
    rpc: RpcClient,
    journal: Arc<dyn Journal>,
    phase: Mutex<Phase>,
    intentional: AtomicBool,
    launches: AtomicU32,
    monitor: Mutex<Option<Monitor>>,
}

/// One supervised daemon process
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: DaemonConfig, rpc: RpcClient, journal: Arc<dyn Journal>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                rpc,
                journal,
                phase: Mutex::new(Phase::Stopped),
                intentional: AtomicBool::new(false),
                launches: AtomicU32::new(0),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase()
    }

    /// Number of times the daemon process has been spawned
    pub fn launch_count(&self) -> u32 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// Launch the daemon and wait until its RPC endpoint answers. A no-op
    /// while already starting, running or stopping.
    pub async fn init(&self) -> Result<()> {
        if !self.inner.transition(Phase::Stopped, Phase::Starting) {
            return Ok(());
        }
        self.inner.intentional.store(false, Ordering::SeqCst);

        let child = match self.inner.launch_ready().await {
            Ok(child) => child,
            Err(e) => {
                self.inner.set_phase(Phase::Stopped);
                return Err(e);
            }
        };

        let (kill, kill_rx) = watch::channel(false);
        let task = tokio::spawn(watch_child(self.inner.clone(), child, kill_rx));
        if let Ok(mut monitor) = self.inner.monitor.lock() {
            *monitor = Some(Monitor { kill, task });
        }
        self.inner.set_phase(Phase::Running);
        Ok(())
    }

    /// Ask the daemon to exit, then kill it if it is still around after the
    /// grace period. A no-op unless running.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.transition(Phase::Running, Phase::Stopping) {
            return Ok(());
        }
        self.inner.intentional.store(true, Ordering::SeqCst);

        let monitor = self.inner.monitor.lock().ok().and_then(|mut m| m.take());

        if let Err(e) = self.inner.rpc.shutdown().await {
            self.inner.journal.record(
                Level::Warn,
                "graceful daemon shutdown failed",
                &[("error", e.to_string())],
            );
        }

        if let Some(Monitor { kill, mut task }) = monitor {
            if timeout(self.inner.config.shutdown_grace, &mut task).await.is_err() {
                self.inner.journal.record(
                    Level::Warn,
                    "daemon still running after grace period, killing",
                    &[("grace_ms", self.inner.config.shutdown_grace.as_millis().to_string())],
                );
                let _ = kill.send(true);
                let _ = task.await;
            }
        }

        self.inner.set_phase(Phase::Stopped);
        self.inner.journal.record(Level::Info, "daemon stopped", &[]);
        Ok(())
    }
}

impl Inner {
    fn phase(&self) -> Phase {
        self.phase.lock().map(|p| *p).unwrap_or(Phase::Stopped)
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    /// Move from `from` to `to` if currently in `from`
    fn transition(&self, from: Phase, to: Phase) -> bool {
        match self.phase.lock() {
            Ok(mut current) if *current == from => {
                *current = to;
                true
            }
            _ => false,
        }
    }

    fn spawn(&self) -> Result<Child> {
        self.config.validate()?;

        let mut child = Command::new(&self.config.binary)
            .args(self.config.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn {}: {}", self.config.binary, e)))?;

        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.record(
            Level::Info,
            "daemon launched",
            &[
                ("pid", child.id().map(|p| p.to_string()).unwrap_or_default()),
                ("port", self.config.rpc_port.to_string()),
                ("launch", launch.to_string()),
            ],
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("daemon: {}", line);
                }
            });
        }

        Ok(child)
    }

    /// Spawn and block until the RPC endpoint answers getVersion
    async fn launch_ready(&self) -> Result<Child> {
        let mut child = self.spawn()?;
        match self.wait_ready(&mut child).await {
            Ok(()) => Ok(child),
            Err(e) => {
                let _ = child.kill().await;
                self.journal.record(Level::Error, "daemon failed to become ready", &[("error", e.to_string())]);
                Err(e)
            }
        }
    }

    async fn wait_ready(&self, child: &mut Child) -> Result<()> {
        for attempt in 1..=self.config.ready_attempts {
            if self.intentional.load(Ordering::SeqCst) {
                return Err(Error::Process("shutdown requested during startup".to_string()));
            }
            if let Some(status) = child.try_wait()? {
                return Err(Error::Process(format!("daemon exited during startup ({})", status)));
            }
            match self.rpc.get_version().await {
                Ok(version) => {
                    self.journal.record(
                        Level::Info,
                        "daemon ready",
                        &[("version", version.version), ("attempt", attempt.to_string())],
                    );
                    return Ok(());
                }
                Err(e) => log::debug!("daemon not ready (attempt {}): {}", attempt, e),
            }
            sleep(self.config.ready_interval).await;
        }
        Err(Error::Process(format!(
            "daemon did not answer on port {} after {} attempts",
            self.config.rpc_port, self.config.ready_attempts
        )))
    }
}

/// Owns the running child. Relaunches after an unexpected exit until the
/// supervisor is shut down or the kill switch is flipped.
async fn watch_child(inner: Arc<Inner>, child: Child, mut kill: watch::Receiver<bool>) {
    let mut child = Some(child);
    loop {
        if let Some(running) = child.as_mut() {
            tokio::select! {
                status = running.wait() => {
                    child = None;
                    if inner.intentional.load(Ordering::SeqCst) {
                        return;
                    }
                    let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
                    inner.journal.record(Level::Warn, "daemon exited unexpectedly", &[("status", status)]);
                }
                _ = kill.changed() => {
                    let _ = running.kill().await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = sleep(inner.config.restart_cooldown) => {}
            _ = kill.changed() => return,
        }
        if inner.intentional.load(Ordering::SeqCst) {
            return;
        }

        // Dropping a half-finished launch kills the child it spawned
        let relaunch = tokio::select! {
            result = inner.launch_ready() => result,
            _ = kill.changed() => return,
        };
        match relaunch {
            Ok(relaunched) => {
                inner.journal.record(Level::Info, "daemon relaunched", &[]);
                child = Some(relaunched);
            }
            Err(e) => {
                inner.journal.record(Level::Error, "daemon relaunch failed", &[("error", e.to_string())]);
            }
        }
    }
}
