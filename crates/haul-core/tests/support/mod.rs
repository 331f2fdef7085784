//! Shared fixtures: a scripted JSON-RPC daemon served by wiremock and a
//! scripted in-process engine.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use haul_core::{
    DaemonConfig, EngineRequest, EngineSignal, Error, JobEvent, Result, TransferEngine,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SECRET: &str = "s3cret";

/// One download as the fake daemon sees it
#[derive(Debug, Clone)]
pub struct Entry {
    pub uris: Vec<String>,
    pub options: Value,
    pub status: String,
    pub completed: u64,
    pub total: u64,
    pub error: Option<(String, String)>,
    pub files: Vec<(String, u64)>,
    pub followed_by: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct DaemonState {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    calls: Vec<Call>,
    /// Method -> remaining forced failures (u32::MAX for always)
    failures: HashMap<String, u32>,
    manifest: Vec<(String, u64)>,
    next_gid: u64,
}

impl DaemonState {
    fn create(&mut self, entry: Entry) -> String {
        self.next_gid += 1;
        let gid = format!("{:016x}", 0x2089_b05e_cca3_d800 + self.next_gid);
        self.entries.insert(gid.clone(), entry);
        self.order.push(gid.clone());
        gid
    }

    fn handle(&mut self, method: &str, params: &[Value]) -> std::result::Result<Value, (i64, String)> {
        if let Some(remaining) = self.failures.get_mut(method) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err((1, format!("{} refused", method)));
            }
        }

        let gid = params.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
        match method {
            "aria2.getVersion" => Ok(json!({"version": "1.37.0", "enabledFeatures": ["BitTorrent"]})),
            "aria2.shutdown" => Ok(json!("OK")),
            "aria2.addUri" => {
                let uris: Vec<String> = params
                    .get(1)
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let options = params.get(2).cloned().unwrap_or_else(|| json!({}));
                let probing = options["bt-metadata-only"] == "true";
                let magnet = uris.first().is_some_and(|u| u.starts_with("magnet:"));

                let mut entry = Entry {
                    uris,
                    options,
                    status: "active".to_string(),
                    completed: 0,
                    total: 0,
                    error: None,
                    files: Vec::new(),
                    followed_by: Vec::new(),
                };

                if probing && magnet {
                    let child = Entry {
                        files: self.manifest.clone(),
                        ..entry.clone()
                    };
                    let child_gid = self.create(child);
                    entry.status = "complete".to_string();
                    entry.files = vec![("[METADATA]2089b05ecca3d829".to_string(), 0)];
                    entry.followed_by = vec![child_gid];
                } else if probing {
                    entry.files = self.manifest.clone();
                }
                Ok(json!(self.create(entry)))
            }
            "aria2.tellStatus" => {
                let entry = self.entries.get(&gid).ok_or_else(|| not_found(&gid))?;
                Ok(status_json(&gid, entry))
            }
            "aria2.pause" | "aria2.unpause" | "aria2.remove" | "aria2.forceRemove" => {
                let entry = self.entries.get_mut(&gid).ok_or_else(|| not_found(&gid))?;
                entry.status = match method {
                    "aria2.pause" => "paused",
                    "aria2.unpause" => "active",
                    _ => "removed",
                }
                .to_string();
                Ok(json!(gid))
            }
            other => Err((1, format!("No such method: {}", other))),
        }
    }
}

fn not_found(gid: &str) -> (i64, String) {
    (1, format!("GID {} is not found", gid))
}

fn status_json(gid: &str, entry: &Entry) -> Value {
    let mut status = json!({
        "gid": gid,
        "status": entry.status,
        "totalLength": entry.total.to_string(),
        "completedLength": entry.completed.to_string(),
        "downloadSpeed": "1024",
        "followedBy": entry.followed_by,
        "files": entry
            .files
            .iter()
            .enumerate()
            .map(|(i, (path, length))| json!({
                "index": (i + 1).to_string(),
                "path": path,
                "length": length.to_string(),
            }))
            .collect::<Vec<_>>(),
    });
    if let Some((code, message)) = &entry.error {
        status["errorCode"] = json!(code);
        status["errorMessage"] = json!(message);
    }
    status
}

/// Scripted stand-in for the daemon's JSON-RPC endpoint
#[derive(Clone, Default)]
pub struct FakeDaemon {
    state: Arc<Mutex<DaemonState>>,
}

impl Respond for FakeDaemon {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let id = body["id"].clone();
        let method = body["method"].as_str().unwrap_or_default().to_string();
        let params = body["params"].as_array().cloned().unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            method: method.clone(),
            params: params.clone(),
        });

        if params.first() != Some(&json!(format!("token:{}", SECRET))) {
            return ResponseTemplate::new(400)
                .set_body_json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": 1, "message": "Unauthorized"}}));
        }

        match state.handle(&method, &params) {
            Ok(result) => ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result})),
            Err((code, message)) => ResponseTemplate::new(400)
                .set_body_json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})),
        }
    }
}

impl FakeDaemon {
    /// Serve a fresh fake daemon on its own mock server
    pub async fn start() -> (Self, MockServer) {
        let server = MockServer::start().await;
        let daemon = Self::default();
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .respond_with(daemon.clone())
            .mount(&server)
            .await;
        (daemon, server)
    }

    fn with<T>(&self, f: impl FnOnce(&mut DaemonState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Files every metadata lookup will report
    pub fn set_manifest(&self, files: &[(&str, u64)]) {
        self.with(|s| s.manifest = files.iter().map(|(p, l)| (p.to_string(), *l)).collect());
    }

    pub fn set_progress(&self, gid: &str, completed: u64, total: u64) {
        self.with(|s| {
            let entry = s.entries.get_mut(gid).unwrap();
            entry.completed = completed;
            entry.total = total;
        });
    }

    pub fn set_status(&self, gid: &str, status: &str) {
        self.with(|s| s.entries.get_mut(gid).unwrap().status = status.to_string());
    }

    pub fn set_error(&self, gid: &str, code: &str, message: &str) {
        self.with(|s| {
            let entry = s.entries.get_mut(gid).unwrap();
            entry.status = "error".to_string();
            entry.error = Some((code.to_string(), message.to_string()));
        });
    }

    /// Finish `gid` the way a magnet's metadata download does, handing the
    /// transfer over to a new download of `total` bytes. Returns its gid.
    pub fn hand_over(&self, gid: &str, total: u64) -> String {
        self.with(|s| {
            let mut child = s.entries.get(gid).unwrap().clone();
            child.status = "active".to_string();
            child.completed = 0;
            child.total = total;
            child.followed_by = Vec::new();
            let child_gid = s.create(child);

            let parent = s.entries.get_mut(gid).unwrap();
            parent.status = "complete".to_string();
            parent.followed_by = vec![child_gid.clone()];
            child_gid
        })
    }

    /// Drop every trace of `gid`, as a relaunched daemon would
    pub fn forget(&self, gid: &str) {
        self.with(|s| {
            s.entries.remove(gid);
        });
    }

    /// Answer `method` with an error envelope `times` times
    pub fn fail(&self, method: &str, times: u32) {
        self.with(|s| {
            s.failures.insert(method.to_string(), times);
        });
    }

    pub fn fail_always(&self, method: &str) {
        self.fail(method, u32::MAX);
    }

    pub fn gids(&self) -> Vec<String> {
        self.with(|s| s.order.clone())
    }

    pub fn entry(&self, gid: &str) -> Option<Entry> {
        self.with(|s| s.entries.get(gid).cloned())
    }

    pub fn calls(&self, method: &str) -> Vec<Call> {
        self.with(|s| s.calls.iter().filter(|c| c.method == method).cloned().collect())
    }
}

/// Daemon settings pointing at `server`, with timings shrunk for tests
pub fn daemon_config(server: &MockServer, download_dir: &std::path::Path) -> DaemonConfig {
    DaemonConfig {
        rpc_port: server.address().port(),
        rpc_secret: SECRET.to_string(),
        download_dir: download_dir.to_string_lossy().to_string(),
        rpc_timeout: Duration::from_millis(500),
        ready_interval: Duration::from_millis(20),
        ready_attempts: 10,
        restart_cooldown: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(2),
        poll_interval: Duration::from_secs(3600),
        manifest_interval: Duration::from_millis(10),
        manifest_attempts: 5,
        ..DaemonConfig::default()
    }
}

#[derive(Default)]
struct EngineState {
    adds: Vec<EngineRequest>,
    add_failures: u32,
    paused: Vec<String>,
    resumed: Vec<String>,
    destroyed: Vec<(String, bool)>,
    fail_destroy: bool,
}

/// Scripted [`TransferEngine`]; tests push signals by hand
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
    signals: broadcast::Sender<EngineSignal>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            signals: broadcast::channel(64).0,
        }
    }
}

impl FakeEngine {
    pub fn emit(&self, signal: EngineSignal) {
        self.signals.send(signal).unwrap();
    }

    pub fn fail_adds(&self, times: u32) {
        self.state.lock().unwrap().add_failures = times;
    }

    pub fn fail_destroy(&self) {
        self.state.lock().unwrap().fail_destroy = true;
    }

    pub fn adds(&self) -> Vec<EngineRequest> {
        self.state.lock().unwrap().adds.clone()
    }

    pub fn destroyed(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn paused(&self) -> Vec<String> {
        self.state.lock().unwrap().paused.clone()
    }
}

#[async_trait]
impl TransferEngine for FakeEngine {
    async fn add(&self, request: &EngineRequest) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.adds.push(request.clone());
        if state.add_failures > 0 {
            state.add_failures -= 1;
            return Err(Error::Transport("tracker unreachable".to_string()));
        }
        Ok(format!("h{}", state.adds.len()))
    }

    async fn pause(&self, handle: &str) -> Result<()> {
        self.state.lock().unwrap().paused.push(handle.to_string());
        Ok(())
    }

    async fn resume(&self, handle: &str) -> Result<()> {
        self.state.lock().unwrap().resumed.push(handle.to_string());
        Ok(())
    }

    async fn destroy(&self, handle: &str, delete_data: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.destroyed.push((handle.to_string(), delete_data));
        if state.fail_destroy {
            return Err(Error::Engine("engine busy".to_string()));
        }
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<EngineSignal> {
        self.signals.subscribe()
    }
}

/// Next event matching `pred`, skipping others; panics after two seconds
pub async fn wait_for<F>(events: &async_channel::Receiver<JobEvent>, mut pred: F) -> JobEvent
where
    F: FnMut(&JobEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Every event already queued
pub fn drain(events: &async_channel::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
