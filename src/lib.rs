//! # download-coordinator
//!
//! Coordinates a media application's downloads with an out-of-process worker
//! daemon that does the actual transfers.
//!
//! ## Design
//!
//! - **One loop thread** - every download proxy lives on a cooperative
//!   [`EventLoop`](eventloop::EventLoop); timers, idle work and urgent work run
//!   there in order, blocking work goes to its thread pool
//! - **Coalesced commands** - commands for the daemon are collapsed per
//!   download and flushed as one batch per tick
//! - **Reconciled status** - status pushed back by the daemon is merged into
//!   each proxy, ignoring stale and too-frequent reports
//! - **Event-driven** - consumers subscribe to [`Event`]s, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use download_coordinator::{Config, DownloaderId, Runtime};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.daemon.program = "/usr/libexec/download-daemon".into();
//!     config.persistence.database_path = Some("downloads.db".into());
//!
//!     let mut runtime = Runtime::init(config)?;
//!     let mut events = runtime.subscribe();
//!     runtime.run()?;
//!
//!     // Work on downloads happens on the loop thread
//!     runtime.call("pause", |backend| backend.pause(DownloaderId(1)))??;
//!
//!     while let Ok(event) = events.blocking_recv() {
//!         println!("Event: {:?}", event);
//!     }
//!     runtime.shutdown()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// The loop-owned registry of download proxies
pub mod backend;
/// Commands sent to the worker daemon
pub mod command;
/// Configuration types
pub mod config;
/// Download consumers (feed items)
pub mod consumer;
/// Worker daemon transports
pub mod daemon;
/// Database persistence layer
pub mod db;
/// Remote download proxies
pub mod downloader;
/// Error types
pub mod error;
/// Cooperative event loop
pub mod eventloop;
/// HTTP header probe
pub mod probe;
/// Coordinator lifecycle
pub mod runtime;
/// Command coalescing
pub mod state_manager;
/// Status blobs reported by the daemon
pub mod status;
/// Downloader record storage
pub mod store;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use backend::{Backend, Phase};
pub use command::{Command, CommandKind};
pub use config::{Config, Settings};
pub use consumer::DownloadConsumer;
pub use daemon::{ChannelDaemon, ChannelTransport, DaemonCommand, DaemonMessage, ProcessDaemon};
pub use db::Database;
pub use downloader::{RemoteDownloader, StatusDisposition};
pub use error::{DaemonError, DatabaseError, DownloadError, Error, Result};
pub use eventloop::{EventLoop, LoopHandle};
pub use runtime::{Runtime, run_with_shutdown};
pub use state_manager::DownloadStateManager;
pub use status::{DownloadStatus, StatusReport};
pub use store::{DownloaderRecord, DownloaderStore, MemoryStore, SqliteStore};
pub use types::{ContentType, Dlid, DownloadState, DownloadType, DownloaderId, Event, ItemId};
