//! Commands sent to the worker daemon.
//!
//! Each command kind carries its own argument struct; the daemon receives them as
//! `{"command": "<kind>", "args": {...}}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::status::DownloadStatus;

/// Arguments of a RESUME command (start or continue a transfer)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeArgs {
    /// URL to fetch
    pub url: String,
    /// MIME type, if known
    pub content_type: Option<String>,
    /// Channel the download belongs to; used for the target directory
    pub channel_name: Option<String>,
}

/// Arguments of a PAUSE command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseArgs {
    /// Pause seeding rather than downloading
    pub upload: bool,
}

/// Arguments of a STOP command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopArgs {
    /// Stop seeding rather than downloading
    pub upload: bool,
    /// Delete the partially downloaded data
    pub delete: bool,
}

/// Arguments of a RESTORE command
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestoreArgs {
    /// Full status blob the daemon-side downloader is rebuilt from
    pub downloader: DownloadStatus,
    /// BitTorrent metadata, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metainfo: Option<Vec<u8>>,
}

/// A command destined for the worker daemon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    /// Stop a transfer
    Stop(StopArgs),
    /// Pause a transfer
    Pause(PauseArgs),
    /// Start or continue a transfer
    Resume(ResumeArgs),
    /// Rebuild a transfer from persisted state
    Restore(RestoreArgs),
}

/// Discriminant of [`Command`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// STOP
    Stop,
    /// PAUSE
    Pause,
    /// RESUME
    Resume,
    /// RESTORE
    Restore,
}

impl Command {
    /// The kind of this command
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Stop(_) => CommandKind::Stop,
            Command::Pause(_) => CommandKind::Pause,
            Command::Resume(_) => CommandKind::Resume,
            Command::Restore(_) => CommandKind::Restore,
        }
    }
}

impl CommandKind {
    /// Whether `self` followed by `next` cancel each other out
    ///
    /// Only a pause/resume pair annihilates; any other later command supersedes
    /// the earlier one.
    pub fn cancels(self, next: CommandKind) -> bool {
        matches!(
            (self, next),
            (CommandKind::Pause, CommandKind::Resume) | (CommandKind::Resume, CommandKind::Pause)
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandKind::Stop => "STOP",
            CommandKind::Pause => "PAUSE",
            CommandKind::Resume => "RESUME",
            CommandKind::Restore => "RESTORE",
        })
    }
}
