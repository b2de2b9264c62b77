//! Database layer for download-coordinator
//!
//! Handles SQLite persistence for remote downloader records.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`downloaders`] - Remote downloader CRUD and lookups

use sqlx::{FromRow, sqlite::SqlitePool};

mod downloaders;
mod migrations;

/// Remote downloader record as stored in the `remote_downloaders` table
///
/// Converted to and from [`DownloaderRecord`](crate::store::DownloaderRecord);
/// the status blob is kept as JSON text.
#[derive(Debug, Clone, FromRow)]
pub struct DownloaderRow {
    /// Persistent id
    pub id: i64,
    /// Download identifier shared with the daemon
    pub dlid: String,
    /// URL the download was created for
    pub orig_url: String,
    /// Current (possibly redirected) URL
    pub url: String,
    /// MIME type ("" = not probed yet, NULL = unknown)
    pub content_type: Option<String>,
    /// Channel the download belongs to
    pub channel_name: Option<String>,
    /// Visible state
    pub state: String,
    /// Status blob as JSON
    pub status: String,
    /// BitTorrent metadata
    pub metainfo: Option<Vec<u8>>,
    /// Seeding was started by the user
    pub manual_upload: bool,
    /// Item the download was started for
    pub main_item_id: Option<i64>,
    /// Part of the torrent data was deleted; seeding cannot resume
    pub child_deleted: bool,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

/// Database handle for download-coordinator
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
