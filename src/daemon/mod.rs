//! Transport to the out-of-process download worker.
//!
//! The coordinator only needs two things from the daemon: a way to send
//! [`DaemonCommand`]s and a stream of [`DaemonMessage`]s. Messages arrive on
//! whatever thread the transport uses; the [`MessageSink`] given to
//! [`DaemonTransport::start`] is responsible for moving them onto the event loop.

mod channel;
mod process;
mod protocol;

pub use channel::{ChannelDaemon, ChannelTransport};
pub use process::ProcessDaemon;
pub use protocol::{DaemonCommand, DaemonMessage};

use std::sync::Arc;

use crate::error::Result;

/// Receives every message from the daemon, on the transport's thread
pub type MessageSink = Arc<dyn Fn(DaemonMessage) + Send + Sync + 'static>;

/// A connection to the worker daemon
pub trait DaemonTransport: Send {
    /// Launch or connect to the daemon and begin delivering its messages to `sink`
    fn start(&mut self, sink: MessageSink) -> Result<()>;

    /// Send one command
    fn send(&mut self, command: DaemonCommand) -> Result<()>;

    /// Human-readable description for logging
    fn describe(&self) -> String;
}
