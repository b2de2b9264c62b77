//! Core types for download-coordinator

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Content type reported for BitTorrent metadata files
pub const BITTORRENT_CONTENT_TYPE: &str = "application/x-bittorrent";

/// Content type used for magnet URIs
pub const MAGNET_CONTENT_TYPE: &str = "application/x-magnet";

/// Opaque download identifier shared with the worker daemon
///
/// Identifiers are regenerated when a failed download restarts, so late replies
/// addressed to the previous attempt no longer match anything.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dlid(String);

impl Dlid {
    /// Identifier used by very old records that never had a real one
    pub const NO_ID: &'static str = "noid";

    /// Generate a random identifier of the form `download%08d`
    ///
    /// Candidates are redrawn until `is_taken` reports them unused.
    pub fn generate(mut is_taken: impl FnMut(&Dlid) -> bool) -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = Dlid(format!("download{:08}", rng.gen_range(0..=99_999_999u32)));
            if !is_taken(&candidate) {
                return candidate;
            }
        }
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the legacy placeholder identifier
    pub fn is_placeholder(&self) -> bool {
        self.0 == Self::NO_ID
    }
}

impl From<&str> for Dlid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Dlid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Dlid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persistent identifier of a remote downloader record
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DownloaderId(pub i64);

impl DownloaderId {
    /// Create a new DownloaderId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for DownloaderId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<DownloaderId> for i64 {
    fn from(id: DownloaderId) -> Self {
        id.0
    }
}

impl fmt::Display for DownloaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for DownloaderId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for DownloaderId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for DownloaderId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Identifier of a consumer entity (e.g. a playable item) interested in a download
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Visible state of a remote download
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadState {
    /// Transferring data
    #[default]
    Downloading,
    /// Paused by the user
    Paused,
    /// Stopped; partial data may have been deleted
    Stopped,
    /// Failed; see the reason fields of the status blob
    Failed,
    /// Completely downloaded
    Finished,
    /// Finished and seeding
    Uploading,
    /// Finished, seeding paused
    UploadingPaused,
    /// Waiting for connectivity
    Offline,
}

impl DownloadState {
    /// Wire/database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Stopped => "stopped",
            DownloadState::Failed => "failed",
            DownloadState::Finished => "finished",
            DownloadState::Uploading => "uploading",
            DownloadState::UploadingPaused => "uploading-paused",
            DownloadState::Offline => "offline",
        }
    }

    /// States that count as a completed download
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DownloadState::Finished | DownloadState::Uploading | DownloadState::UploadingPaused
        )
    }

    /// States set locally and echoed back verbatim by the daemon in command replies
    ///
    /// A command reply whose state differs from ours while both are in this set was
    /// produced by an older command and must be discarded.
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            DownloadState::Downloading
                | DownloadState::Paused
                | DownloadState::Stopped
                | DownloadState::UploadingPaused
                | DownloadState::Finished
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "downloading" => Ok(DownloadState::Downloading),
            "paused" => Ok(DownloadState::Paused),
            "stopped" => Ok(DownloadState::Stopped),
            "failed" => Ok(DownloadState::Failed),
            "finished" => Ok(DownloadState::Finished),
            "uploading" => Ok(DownloadState::Uploading),
            "uploading-paused" => Ok(DownloadState::UploadingPaused),
            "offline" => Ok(DownloadState::Offline),
            other => Err(format!("unknown download state: {other}")),
        }
    }
}

/// What we know about the content type of a download's URL
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ContentType {
    /// Not yet probed
    #[default]
    Pending,
    /// Probed, but the server did not tell us; the daemon will work it out
    Unknown,
    /// Known MIME type
    Known(String),
}

impl ContentType {
    /// The MIME type, if known
    pub fn as_option(&self) -> Option<&str> {
        match self {
            ContentType::Known(mime) => Some(mime),
            _ => None,
        }
    }

    /// Whether this download is handled by the BitTorrent side of the daemon
    pub fn is_bittorrent(&self) -> bool {
        matches!(self.as_option(), Some(BITTORRENT_CONTENT_TYPE | MAGNET_CONTENT_TYPE))
    }

    /// Database column value (`""` pending, `NULL` unknown)
    pub fn to_column(&self) -> Option<String> {
        match self {
            ContentType::Pending => Some(String::new()),
            ContentType::Unknown => None,
            ContentType::Known(mime) => Some(mime.clone()),
        }
    }

    /// Inverse of [`ContentType::to_column`]
    pub fn from_column(value: Option<String>) -> Self {
        match value {
            None => ContentType::Unknown,
            Some(mime) if mime.is_empty() => ContentType::Pending,
            Some(mime) => ContentType::Known(mime),
        }
    }
}

/// Transfer protocol of a download
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadType {
    /// Plain HTTP(S)
    Http,
    /// BitTorrent (torrent file or magnet URI)
    Bittorrent,
}

/// Event emitted by the coordinator to frontends
///
/// Events are sent over a `tokio::sync::broadcast` channel; see
/// [`Backend::subscribe`](crate::backend::Backend::subscribe).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A downloader's visible fields changed
    DownloaderChanged {
        /// Persistent id
        id: DownloaderId,
        /// Current identifier
        dlid: Dlid,
        /// Current state
        state: DownloadState,
    },

    /// A download transitioned into a finished-like state
    DownloadFinished {
        /// Persistent id
        id: DownloaderId,
        /// Current identifier
        dlid: Dlid,
    },

    /// A finished download's file moved
    FileMigrated {
        /// Persistent id
        id: DownloaderId,
        /// Previous location
        old_filename: PathBuf,
        /// New location
        new_filename: PathBuf,
    },

    /// A bulk pause/resume/cancel finished without queuing any command
    SyncCommandComplete,

    /// Seeding cannot resume because part of the torrent was deleted
    SeedingUnavailable {
        /// Persistent id
        id: DownloaderId,
    },

    /// The worker daemon reported it is ready
    DaemonReady,

    /// The worker daemon reported an error or exited unexpectedly
    DaemonError {
        /// Description from the daemon or transport
        message: String,
    },

    /// The downloader subsystem has shut down
    Shutdown,
}
