//! Daemon status vocabulary and its translation into job terms.

use serde::{Deserialize, Deserializer};

use crate::registry::StatusReport;
use crate::types::{FileEntry, JobStatus, Progress};

/// Keys requested from `aria2.tellStatus` on every reconciliation tick
pub const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorCode",
    "errorMessage",
    "followedBy",
];

/// Keys requested while waiting for a file manifest
pub const MANIFEST_KEYS: &[&str] = &["gid", "status", "files", "followedBy", "errorCode", "errorMessage"];

/// Path prefix the daemon uses while a torrent's metadata is still missing
const METADATA_PLACEHOLDER: &str = "[METADATA]";

/// Every status the daemon reports. Anything else fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

impl DaemonState {
    pub const ALL: [DaemonState; 6] = [
        DaemonState::Active,
        DaemonState::Waiting,
        DaemonState::Paused,
        DaemonState::Error,
        DaemonState::Complete,
        DaemonState::Removed,
    ];

    pub fn job_status(self) -> JobStatus {
        match self {
            DaemonState::Active => JobStatus::Active,
            DaemonState::Waiting => JobStatus::Queued,
            DaemonState::Paused => JobStatus::Paused,
            DaemonState::Error => JobStatus::Failed,
            DaemonState::Complete => JobStatus::Completed,
            DaemonState::Removed => JobStatus::Canceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonFile {
    /// 1-based on the wire
    #[serde(deserialize_with = "de_u64")]
    pub index: u64,
    #[serde(default)]
    pub path: String,
    #[serde(default, deserialize_with = "de_u64")]
    pub length: u64,
}

/// `aria2.tellStatus` result, limited to the keys this crate asks for
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    #[serde(default)]
    pub gid: String,
    pub status: DaemonState,
    #[serde(default, deserialize_with = "de_u64")]
    pub total_length: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub completed_length: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub download_speed: u64,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub files: Vec<DaemonFile>,
    #[serde(default)]
    pub followed_by: Vec<String>,
}

impl DaemonStatus {
    pub fn to_report(&self) -> StatusReport {
        let status = self.status.job_status();
        let error = (status == JobStatus::Failed).then(|| self.diagnostic());
        StatusReport {
            status,
            progress: Progress::from_counts(self.completed_length, self.total_length, Some(self.download_speed)),
            error,
        }
    }

    /// The download that carries on from this one. Magnets finish a
    /// metadata-only download first and continue under a new gid.
    pub fn follow_up(&self) -> Option<&str> {
        if self.status != DaemonState::Complete {
            return None;
        }
        self.followed_by.first().map(String::as_str)
    }

    /// `[code] message` as far as the daemon provided either
    pub fn diagnostic(&self) -> String {
        match (&self.error_code, &self.error_message) {
            (Some(code), Some(message)) => format!("[{}] {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => format!("daemon error code {}", code),
            (None, None) => "daemon reported an error".to_string(),
        }
    }

    /// The file list with 0-based indices, once real metadata is known
    pub fn manifest(&self) -> Option<Vec<FileEntry>> {
        if self.files.is_empty()
            || self
                .files
                .iter()
                .any(|f| f.path.is_empty() || f.path.starts_with(METADATA_PLACEHOLDER))
        {
            return None;
        }
        Some(
            self.files
                .iter()
                .map(|f| FileEntry {
                    index: f.index.saturating_sub(1) as usize,
                    path: f.path.clone(),
                    size: f.length,
                })
                .collect(),
        )
    }
}

/// The daemon encodes integers as JSON strings
fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Text(String),
        Int(u64),
    }

    match Number::deserialize(deserializer)? {
        Number::Int(n) => Ok(n),
        Number::Text(s) if s.is_empty() => Ok(0),
        Number::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mapping_is_total_and_distinct() {
        let mapped: Vec<JobStatus> = DaemonState::ALL.iter().map(|s| s.job_status()).collect();
        assert_eq!(
            mapped,
            vec![
                JobStatus::Active,
                JobStatus::Queued,
                JobStatus::Paused,
                JobStatus::Failed,
                JobStatus::Completed,
                JobStatus::Canceled,
            ]
        );
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let parsed = serde_json::from_value::<DaemonStatus>(json!({"gid": "a", "status": "seeding"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_decodes_string_numbers() {
        let status: DaemonStatus = serde_json::from_value(json!({
            "gid": "2089b05ecca3d829",
            "status": "active",
            "totalLength": "34896138",
            "completedLength": "17448069",
            "downloadSpeed": "204800"
        }))
        .unwrap();

        let report = status.to_report();
        assert_eq!(report.status, JobStatus::Active);
        assert_eq!(report.progress.percent, 50);
        assert_eq!(report.progress.bytes_downloaded, 17448069);
        assert_eq!(report.progress.speed, Some(204800));
        assert_eq!(report.error, None);
    }

    #[test]
    fn test_zero_total_reports_zero_percent() {
        let status: DaemonStatus = serde_json::from_value(json!({
            "status": "active",
            "totalLength": "0",
            "completedLength": "0"
        }))
        .unwrap();
        assert_eq!(status.to_report().progress.percent, 0);
    }

    #[test]
    fn test_error_carries_code_and_message() {
        let status: DaemonStatus = serde_json::from_value(json!({
            "status": "error",
            "errorCode": "3",
            "errorMessage": "Resource not found"
        }))
        .unwrap();
        let report = status.to_report();
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("[3] Resource not found"));
    }

    #[test]
    fn test_follow_up_only_after_completion() {
        let metadata: DaemonStatus = serde_json::from_value(json!({
            "status": "complete",
            "followedBy": ["2089b05ecca3d802"]
        }))
        .unwrap();
        assert_eq!(metadata.follow_up(), Some("2089b05ecca3d802"));

        let running: DaemonStatus = serde_json::from_value(json!({
            "status": "active",
            "followedBy": ["2089b05ecca3d802"]
        }))
        .unwrap();
        assert_eq!(running.follow_up(), None);
    }

    #[test]
    fn test_manifest_waits_for_metadata() {
        let pending: DaemonStatus = serde_json::from_value(json!({
            "status": "active",
            "files": [{"index": "1", "path": "[METADATA]c9fe1c0a", "length": "0"}]
        }))
        .unwrap();
        assert_eq!(pending.manifest(), None);

        let ready: DaemonStatus = serde_json::from_value(json!({
            "status": "complete",
            "files": [
                {"index": "1", "path": "/dl/Show/e01.mkv", "length": "100"},
                {"index": "2", "path": "/dl/Show/e02.mkv", "length": "200"}
            ]
        }))
        .unwrap();
        let files = ready.manifest().unwrap();
        assert_eq!(files[0], FileEntry { index: 0, path: "/dl/Show/e01.mkv".to_string(), size: 100 });
        assert_eq!(files[1].index, 1);
    }
}
