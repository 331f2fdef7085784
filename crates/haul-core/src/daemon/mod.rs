//! External download daemon backend
//!
//! The daemon runs as a child process and is driven over JSON-RPC. This
//! module launches and supervises it, talks to it, and reconciles what it
//! reports into job state.

mod downloader;
mod poller;
mod rpc;
mod status;
mod supervisor;

pub use downloader::ExternalDaemonDownloader;
pub use rpc::{RpcClient, RpcError, VersionInfo};
pub use status::{DaemonFile, DaemonState, DaemonStatus};
pub use supervisor::{Phase, ProcessSupervisor};

use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Settings;

/// Launch arguments and timing for the daemon
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub binary: String,
    pub rpc_port: u16,
    pub rpc_secret: String,
    pub download_dir: String,
    pub max_concurrent_downloads: u32,
    /// Bytes per second, 0 is unlimited
    pub max_download_limit: u64,
    pub check_integrity: bool,
    pub enable_dht: bool,
    /// Minutes
    pub seed_time: u32,
    pub rpc_timeout: Duration,
    pub ready_interval: Duration,
    pub ready_attempts: u32,
    pub restart_cooldown: Duration,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
    pub manifest_interval: Duration,
    pub manifest_attempts: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Settings::default().daemon_config()
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.binary.trim().is_empty() {
            return Err(Error::Config("daemon binary is empty".to_string()));
        }
        if self.rpc_port == 0 {
            return Err(Error::Config("RPC port must be non-zero".to_string()));
        }
        if self.rpc_secret.is_empty() || self.rpc_secret.chars().any(char::is_whitespace) {
            return Err(Error::Config("RPC secret must be non-empty without whitespace".to_string()));
        }
        if self.download_dir.trim().is_empty() {
            return Err(Error::Config("download directory is empty".to_string()));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(Error::Config("max concurrent downloads must be at least 1".to_string()));
        }
        if self.ready_attempts == 0 || self.manifest_attempts == 0 {
            return Err(Error::Config("attempt counts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The fixed argument set the daemon is launched with
    pub fn args(&self) -> Vec<String> {
        vec![
            "--enable-rpc=true".to_string(),
            "--rpc-listen-all=false".to_string(),
            format!("--rpc-listen-port={}", self.rpc_port),
            format!("--rpc-secret={}", self.rpc_secret),
            format!("--dir={}", self.download_dir),
            format!("--max-concurrent-downloads={}", self.max_concurrent_downloads),
            format!("--max-overall-download-limit={}", self.max_download_limit),
            format!("--check-integrity={}", self.check_integrity),
            format!("--enable-dht={}", self.enable_dht),
            format!("--seed-time={}", self.seed_time),
            "--continue=true".to_string(),
            "--quiet=true".to_string(),
        ]
    }

    pub fn rpc_client(&self) -> Result<RpcClient> {
        RpcClient::new(self.rpc_port, &self.rpc_secret, self.rpc_timeout).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DaemonConfig {
        DaemonConfig {
            rpc_port: 6801,
            rpc_secret: "s3cret".to_string(),
            download_dir: "/srv/media".to_string(),
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn test_args_carry_settings() {
        let args = config().args();
        assert!(args.contains(&"--rpc-listen-port=6801".to_string()));
        assert!(args.contains(&"--rpc-secret=s3cret".to_string()));
        assert!(args.contains(&"--dir=/srv/media".to_string()));
        assert!(args.contains(&"--check-integrity=true".to_string()));
        assert!(args.contains(&"--seed-time=0".to_string()));
    }

    #[test]
    fn test_validation() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.rpc_port = 0;
        assert!(matches!(bad.validate(), Err(Error::Config(_))));

        let mut bad = config();
        bad.rpc_secret = "two words".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.max_concurrent_downloads = 0;
        assert!(bad.validate().is_err());
    }
}
