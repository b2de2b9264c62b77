//! Status blob reported by the worker daemon.
//!
//! The daemon sends a camelCase JSON object per download. It omits keys whose
//! value has not changed since the previous push, so the blob kept on a
//! [`RemoteDownloader`](crate::downloader::RemoteDownloader) is updated key by key
//! with [`DownloadStatus::merge`]; absent keys keep their previous value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::types::{DownloadState, Dlid};

/// Per-download status blob
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadStatus {
    /// Daemon-side state; the visible state is derived from it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DownloadState>,
    /// Download rate in bytes per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    /// Upload rate in bytes per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_rate: Option<f64>,
    /// Estimated seconds remaining
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<i64>,
    /// Total size in bytes (-1 when unknown)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<i64>,
    /// Bytes downloaded so far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_size: Option<i64>,
    /// Bytes uploaded so far (seeding)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<i64>,
    /// Full path of the downloaded file or directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
    /// File name without directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_filename: Option<String>,
    /// Human readable activity ("connecting", "checking data", ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    /// Number of retries so far (-1 when not retrying)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,
    /// When the next retry happens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_time: Option<DateTime<Utc>>,
    /// Long failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_failed: Option<String>,
    /// Short failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_reason_failed: Option<String>,
    /// Which daemon-side downloader handles this transfer; absent until it started once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dler_type: Option<String>,
    /// Channel (feed) the download belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    /// URL the daemon is fetching (magnet restores)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Keys this crate does not interpret; carried along for restores
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! merge_fields {
    ($dst:expr, $src:expr; $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

impl DownloadStatus {
    /// A blank status with only the state set
    pub fn with_state(state: DownloadState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    /// Whether nothing at all is known about this download
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay the keys present in `update` onto this blob
    pub fn merge(&mut self, update: DownloadStatus) {
        merge_fields!(self, update;
            state,
            rate,
            up_rate,
            eta,
            total_size,
            current_size,
            uploaded,
            filename,
            short_filename,
            activity,
            retry_count,
            retry_time,
            reason_failed,
            short_reason_failed,
            dler_type,
            channel_name,
            url,
        );
        self.extra.extend(update.extra);
    }

    /// Copy of this blob with `update` merged on top
    pub fn merged(&self, update: DownloadStatus) -> Self {
        let mut merged = self.clone();
        merged.merge(update);
        merged
    }
}

/// One status push from the daemon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Identifier the report is addressed to
    pub dlid: Dlid,
    /// BitTorrent metadata, only sent when it changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metainfo: Option<Vec<u8>>,
    /// Status keys that changed
    #[serde(flatten)]
    pub status: DownloadStatus,
}

impl StatusReport {
    /// The state the daemon reports, `downloading` when absent
    pub fn reported_state(&self) -> DownloadState {
        self.status.state.unwrap_or_default()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_absent_keys() {
        let mut status = DownloadStatus {
            state: Some(DownloadState::Downloading),
            rate: Some(100.0),
            total_size: Some(4096),
            filename: Some(PathBuf::from("/tmp/a.mp4")),
            ..Default::default()
        };

        status.merge(DownloadStatus {
            rate: Some(250.0),
            current_size: Some(1024),
            ..Default::default()
        });

        assert_eq!(status.state, Some(DownloadState::Downloading));
        assert_eq!(status.rate, Some(250.0));
        assert_eq!(status.total_size, Some(4096));
        assert_eq!(status.current_size, Some(1024));
        assert_eq!(status.filename, Some(PathBuf::from("/tmp/a.mp4")));
    }

    #[test]
    fn report_parses_daemon_json_with_unknown_keys() {
        let json = r#"{
            "dlid": "download00000001",
            "state": "uploading-paused",
            "rate": 0,
            "upRate": 12.5,
            "totalSize": 100,
            "currentSize": 100,
            "shortFilename": "a.torrent",
            "retryTime": "2026-10-19T12:00:00Z",
            "infohash": "abcdef"
        }"#;

        let report: StatusReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.dlid, Dlid::from("download00000001"));
        assert_eq!(report.reported_state(), DownloadState::UploadingPaused);
        assert_eq!(report.status.up_rate, Some(12.5));
        assert_eq!(report.status.short_filename.as_deref(), Some("a.torrent"));
        assert!(report.status.retry_time.is_some());
        assert_eq!(
            report.status.extra.get("infohash"),
            Some(&Value::String("abcdef".into()))
        );
        assert!(!report.status.extra.contains_key("dlid"));
        assert!(report.metainfo.is_none());
    }

    #[test]
    fn missing_state_defaults_to_downloading() {
        let report: StatusReport = serde_json::from_str(r#"{"dlid": "d"}"#).unwrap();
        assert_eq!(report.reported_state(), DownloadState::Downloading);
        assert!(report.status.is_empty());
    }

    #[test]
    fn serialization_omits_unset_keys() {
        let status = DownloadStatus::with_state(DownloadState::Paused);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"state": "paused"}));
    }
}
