//! Error types for download-coordinator
//!
//! This module provides the error handling for the crate:
//! - A top-level [`Error`] used by every fallible operation
//! - Domain-specific error types for persistence, the worker daemon and download control
//! - Contract violations (an unregistered identifier, removing an unknown socket callback)
//!   are returned to the caller; best-effort failures are logged where they happen

use std::path::PathBuf;
use thiserror::Error;

use crate::types::Dlid;

/// Result type alias for download-coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for download-coordinator
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "daemon.program")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Worker daemon lifecycle or transport error
    #[error("daemon error: {0}")]
    Daemon(#[from] DaemonError),

    /// Download control error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// A command was queued for an identifier that was never registered with `add_download()`
    #[error("add_download() not called before queue() for {dlid}")]
    UnregisteredDownload {
        /// The identifier the command was queued for
        dlid: Dlid,
    },

    /// Removing a socket callback that was never registered
    #[error("no {direction} callback registered for fd {fd}")]
    CallbackNotRegistered {
        /// Raw file descriptor of the socket
        fd: i32,
        /// "read" or "write"
        direction: &'static str,
    },

    /// A URL the coordinator does not know how to download
    #[error("don't know how to handle {0}")]
    UnsupportedUrl(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress")]
    ShuttingDown,

    /// A dispatched callback failed
    #[error("callback failed: {0}")]
    Callback(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// The write-behind task has stopped
    #[error("store writer closed")]
    WriterClosed,
}

/// Worker daemon errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The daemon process could not be spawned
    #[error("failed to start daemon {program}: {reason}")]
    SpawnFailed {
        /// Program that was executed
        program: PathBuf,
        /// Why the spawn failed
        reason: String,
    },

    /// A command was sent before the transport was started
    #[error("daemon transport not started")]
    NotStarted,

    /// The transport's outgoing channel is closed (daemon exited)
    #[error("daemon connection closed")]
    Disconnected,

    /// The daemon sent a message that could not be decoded
    #[error("malformed daemon message: {0}")]
    Malformed(String),
}

/// Download control errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No downloader with this id is tracked
    #[error("downloader {id} not found")]
    NotFound {
        /// The downloader id that was not found
        id: i64,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} downloader {id} in state {current_state}")]
    InvalidState {
        /// The downloader id
        id: i64,
        /// The operation that was attempted (e.g., "start_upload")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// Moving a finished file to its new home failed
    #[error("failed to migrate {source_path} to {dest_path}: {reason}")]
    MigrateFailed {
        /// Where the file was
        source_path: PathBuf,
        /// Where it should have gone
        dest_path: PathBuf,
        /// The reason the move failed
        reason: String,
    },

    /// Unexpected HTTP status while probing a URL
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatusCode(u16),
}

impl Error {
    /// Construct a configuration error for a specific key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
