//! Messages exchanged with the worker daemon, one JSON object per line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::command::Command;
use crate::status::StatusReport;
use crate::types::Dlid;

/// Coordinator → daemon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DaemonCommand {
    /// One consolidated set of commands, at most one per identifier
    Batch {
        /// Pending command per identifier
        commands: BTreeMap<Dlid, Command>,
    },
    /// Move a finished download's file into `directory`
    Migrate {
        /// Download to move
        dlid: Dlid,
        /// Destination directory
        directory: PathBuf,
    },
    /// Stop every transfer and exit
    Shutdown,
}

impl DaemonCommand {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonCommand::Batch { .. } => "batch",
            DaemonCommand::Migrate { .. } => "migrate",
            DaemonCommand::Shutdown => "shutdown",
        }
    }
}

/// Daemon → coordinator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DaemonMessage {
    /// The daemon finished starting and accepts commands
    Ready,
    /// Status of one download
    Status {
        /// Direct reply to a command rather than a periodic push
        #[serde(default)]
        cmd_done: bool,
        /// The reported fields
        status: StatusReport,
    },
    /// The daemon stopped after a shutdown request
    ShutdownComplete,
    /// The daemon hit an error it could not handle, or exited unexpectedly
    Error {
        /// Description
        message: String,
    },
}
