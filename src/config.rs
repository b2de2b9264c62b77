//! Configuration types for download-coordinator

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::error::{Error, Result};

/// Event loop tuning (thread pool size, slow-call diagnostics)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLoopConfig {
    /// Number of worker threads for blocking calls (default: 4)
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,

    /// A single dispatch slower than this is logged (default: 0.5s)
    #[serde(default = "default_slow_call_threshold")]
    pub slow_call_threshold: Duration,

    /// Cumulative time per callback name before it is logged and reset (default: 5s)
    #[serde(default = "default_cumulative_slow_threshold")]
    pub cumulative_slow_threshold: Duration,

    /// How long shutdown waits for each worker thread to exit (default: 0.5s)
    ///
    /// Workers may be stuck in the blocking call they exist for; threads that do not
    /// exit in time are left behind and do not hold up process exit.
    #[serde(default = "default_thread_join_timeout")]
    pub thread_join_timeout: Duration,

    /// Queue length above which a warning is logged (default: 1000)
    #[serde(default = "default_queue_size_warning")]
    pub queue_size_warning: usize,

    /// Maximum number of queue length warnings per queue (default: 5)
    #[serde(default = "default_queue_size_warning_limit")]
    pub queue_size_warning_limit: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: default_thread_pool_size(),
            slow_call_threshold: default_slow_call_threshold(),
            cumulative_slow_threshold: default_cumulative_slow_threshold(),
            thread_join_timeout: default_thread_join_timeout(),
            queue_size_warning: default_queue_size_warning(),
            queue_size_warning_limit: default_queue_size_warning_limit(),
        }
    }
}

/// Command batching and status reconciliation timings
///
/// The three intervals are independent: commands flush every `update_interval`,
/// status pushes closer together than `min_status_update_spacing` do not notify
/// consumers, and status-only changes are written to disk after `save_delay`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Interval between command batch flushes (default: 1s)
    #[serde(default = "default_update_interval")]
    pub update_interval: Duration,

    /// Minimum spacing between status updates before they are rate limited (default: 0.7s)
    #[serde(default = "default_min_status_update_spacing")]
    pub min_status_update_spacing: Duration,

    /// Delay before persisting a status-only change (default: 15s)
    #[serde(default = "default_save_delay")]
    pub save_delay: Duration,

    /// Refresh interval of the "retrying in ..." activity text (default: 1s)
    #[serde(default = "default_retry_time_refresh")]
    pub retry_time_refresh: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
            min_status_update_spacing: default_min_status_update_spacing(),
            save_delay: default_save_delay(),
            retry_time_refresh: default_retry_time_refresh(),
        }
    }
}

/// How to launch the worker daemon process
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Daemon executable
    #[serde(default)]
    pub program: PathBuf,

    /// Arguments passed to the daemon
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the daemon
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Data storage
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (None = keep records in memory only)
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// User preferences read by the coordinator at decision points
///
/// Published through a `tokio::sync::watch` channel so a change can be noticed
/// by the event loop; see [`Runtime::update_settings`](crate::runtime::Runtime::update_settings).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Stop automatic seeding once the upload ratio is exceeded (default: false)
    #[serde(default)]
    pub limit_upload_ratio: bool,

    /// Upload ratio at which automatic seeding stops (default: 1.5)
    #[serde(default = "default_upload_ratio")]
    pub upload_ratio: f64,

    /// Directory finished downloads live in (default: "./Movies")
    #[serde(default = "default_movies_directory")]
    pub movies_directory: PathBuf,

    /// Maximum number of torrents seeding automatically (default: 10)
    #[serde(default = "default_upstream_torrent_limit")]
    pub upstream_torrent_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            limit_upload_ratio: false,
            upload_ratio: default_upload_ratio(),
            movies_directory: default_movies_directory(),
            upstream_torrent_limit: default_upstream_torrent_limit(),
        }
    }
}

impl Settings {
    /// Directory partial downloads are written to
    pub fn incomplete_downloads_dir(&self) -> PathBuf {
        self.movies_directory.join("Incomplete Downloads")
    }
}

/// Main configuration
///
/// Fields are organized into logical sub-configs:
/// - [`event_loop`](EventLoopConfig) - thread pool and diagnostics
/// - [`coordinator`](CoordinatorConfig) - flush cadence and status timings
/// - [`daemon`](DaemonConfig) - worker process launch
/// - [`persistence`](PersistenceConfig) - storage
/// - [`settings`](Settings) - user preferences
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Event loop tuning
    #[serde(default)]
    pub event_loop: EventLoopConfig,

    /// Command batching and status timings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Worker daemon launch
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// User preferences
    #[serde(default)]
    pub settings: Settings,
}

impl Config {
    /// Check values that would make the coordinator misbehave
    pub fn validate(&self) -> Result<()> {
        if self.event_loop.thread_pool_size == 0 {
            return Err(Error::config(
                "thread pool needs at least one thread",
                "event_loop.thread_pool_size",
            ));
        }
        if self.coordinator.update_interval.is_zero() {
            return Err(Error::config(
                "update interval must be positive",
                "coordinator.update_interval",
            ));
        }
        if !(self.settings.upload_ratio.is_finite() && self.settings.upload_ratio >= 0.0) {
            return Err(Error::config(
                "upload ratio must be a non-negative number",
                "settings.upload_ratio",
            ));
        }
        Ok(())
    }
}

fn default_thread_pool_size() -> usize {
    4
}

fn default_slow_call_threshold() -> Duration {
    Duration::from_millis(500)
}

fn default_cumulative_slow_threshold() -> Duration {
    Duration::from_secs(5)
}

fn default_thread_join_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_queue_size_warning() -> usize {
    1000
}

fn default_queue_size_warning_limit() -> usize {
    5
}

fn default_update_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_min_status_update_spacing() -> Duration {
    Duration::from_millis(700)
}

fn default_save_delay() -> Duration {
    Duration::from_secs(15)
}

fn default_retry_time_refresh() -> Duration {
    Duration::from_secs(1)
}

fn default_upload_ratio() -> f64 {
    1.5
}

fn default_movies_directory() -> PathBuf {
    PathBuf::from("./Movies")
}

fn default_upstream_torrent_limit() -> usize {
    10
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.event_loop.thread_pool_size, 4);
        assert_eq!(config.event_loop.slow_call_threshold, Duration::from_millis(500));
        assert_eq!(config.event_loop.cumulative_slow_threshold, Duration::from_secs(5));
        assert_eq!(config.coordinator.update_interval, Duration::from_secs(1));
        assert_eq!(
            config.coordinator.min_status_update_spacing,
            Duration::from_millis(700)
        );
        assert_eq!(config.coordinator.save_delay, Duration::from_secs(15));
        assert!(config.persistence.database_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.event_loop.queue_size_warning, 1000);
    }

    #[test]
    fn partial_settings_keep_other_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"settings": {"limit_upload_ratio": true, "upstream_torrent_limit": 2}}"#,
        )
        .unwrap();
        assert!(config.settings.limit_upload_ratio);
        assert_eq!(config.settings.upstream_torrent_limit, 2);
        assert_eq!(config.settings.upload_ratio, 1.5);
    }

    #[test]
    fn validate_rejects_empty_thread_pool() {
        let mut config = Config::default();
        config.event_loop.thread_pool_size = 0;
        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("event_loop.thread_pool_size"));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_downloads_dir_is_under_movies() {
        let settings = Settings {
            movies_directory: PathBuf::from("/media/movies"),
            ..Default::default()
        };
        assert_eq!(
            settings.incomplete_downloads_dir(),
            PathBuf::from("/media/movies/Incomplete Downloads")
        );
    }
}
