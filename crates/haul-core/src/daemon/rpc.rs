//! JSON-RPC 2.0 client for the download daemon.
//!
//! Requests go out as HTTP POSTs to the daemon's loopback endpoint. Every
//! call carries `token:<secret>` as its first positional parameter and is
//! bounded by its own timeout.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use super::status::DaemonStatus;
use crate::error::Error;

/// Errors from a single RPC exchange
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("{0} timed out")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("daemon answered HTTP {0}")]
    Http(u16),

    #[error("daemon returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Parse(String),
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout(_) | RpcError::Connection(_) | RpcError::Http(_) => {
                Error::Transport(err.to_string())
            }
            RpcError::Rpc { .. } | RpcError::Parse(_) => Error::Protocol(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// `aria2.getVersion` result
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub enabled_features: Vec<String>,
}

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Client for the daemon listening on loopback `port`
    pub fn new(port: u16, secret: &str, call_timeout: Duration) -> Result<Self, RpcError> {
        Self::with_endpoint(format!("http://127.0.0.1:{}/jsonrpc", port), secret, call_timeout)
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        secret: &str,
        call_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| RpcError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token: format!("token:{}", secret),
            timeout: call_timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Invoke `method` with `params` (the token is prepended here)
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut full = Vec::with_capacity(params.len() + 1);
        full.push(Value::String(self.token.clone()));
        full.extend(params);

        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params: full,
        };

        let exchange = async {
            let response = self
                .http
                .post(&self.endpoint)
                .json(&request)
                .send()
                .await
                .map_err(|e| RpcError::Connection(e.to_string()))?;
            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|e| RpcError::Connection(e.to_string()))?;
            Ok::<_, RpcError>((status, body))
        };

        let (status, body) = timeout(self.timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout(method.to_string()))??;

        decode(status, &body)
    }

    pub async fn add_uri(&self, uris: &[String], options: &Map<String, Value>) -> Result<String, RpcError> {
        self.call(
            "aria2.addUri",
            vec![Value::from(uris.to_vec()), Value::Object(options.clone())],
        )
        .await
    }

    pub async fn tell_status(&self, gid: &str, keys: &[&str]) -> Result<DaemonStatus, RpcError> {
        let mut params = vec![Value::from(gid)];
        if !keys.is_empty() {
            params.push(Value::from(keys.to_vec()));
        }
        self.call("aria2.tellStatus", params).await
    }

    pub async fn pause(&self, gid: &str) -> Result<String, RpcError> {
        self.call("aria2.pause", vec![Value::from(gid)]).await
    }

    pub async fn unpause(&self, gid: &str) -> Result<String, RpcError> {
        self.call("aria2.unpause", vec![Value::from(gid)]).await
    }

    pub async fn remove(&self, gid: &str) -> Result<String, RpcError> {
        self.call("aria2.remove", vec![Value::from(gid)]).await
    }

    pub async fn force_remove(&self, gid: &str) -> Result<String, RpcError> {
        self.call("aria2.forceRemove", vec![Value::from(gid)]).await
    }

    pub async fn shutdown(&self) -> Result<String, RpcError> {
        self.call("aria2.shutdown", Vec::new()).await
    }

    pub async fn get_version(&self) -> Result<VersionInfo, RpcError> {
        self.call("aria2.getVersion", Vec::new()).await
    }
}

/// Turn an HTTP answer into a typed result. An error envelope wins over the
/// HTTP status, since the daemon reports RPC errors with a 4xx code.
fn decode<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, RpcError> {
    let response: RpcResponse = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(_) if !status.is_success() => return Err(RpcError::Http(status.as_u16())),
        Err(e) => return Err(RpcError::Parse(e.to_string())),
    };

    if let Some(err) = response.error {
        return Err(RpcError::Rpc {
            code: err.code,
            message: err.message,
        });
    }

    if !status.is_success() {
        return Err(RpcError::Http(status.as_u16()));
    }

    let result = response
        .result
        .ok_or_else(|| RpcError::Parse("missing result".to_string()))?;
    serde_json::from_value(result).map_err(|e| RpcError::Parse(e.to_string()))
}
