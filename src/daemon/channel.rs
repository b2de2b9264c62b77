//! In-process transport, for embedding a daemon in the same process and for tests.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{DaemonError, Result};
use crate::eventloop::lock;

use super::{DaemonCommand, DaemonMessage, DaemonTransport, MessageSink};

#[derive(Default)]
struct Peer {
    sink: Option<MessageSink>,
    backlog: Vec<DaemonMessage>,
}

/// Coordinator side of an in-process daemon connection
pub struct ChannelTransport {
    commands: mpsc::UnboundedSender<DaemonCommand>,
    peer: Arc<Mutex<Peer>>,
}

/// Daemon side of an in-process connection
///
/// Messages sent before the coordinator started the transport are held back
/// and delivered, in order, on start.
pub struct ChannelDaemon {
    commands: mpsc::UnboundedReceiver<DaemonCommand>,
    peer: Arc<Mutex<Peer>>,
}

impl ChannelTransport {
    /// Create a connected transport / daemon pair
    pub fn pair() -> (ChannelTransport, ChannelDaemon) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Mutex::new(Peer::default()));
        (
            ChannelTransport {
                commands: tx,
                peer: Arc::clone(&peer),
            },
            ChannelDaemon { commands: rx, peer },
        )
    }
}

impl DaemonTransport for ChannelTransport {
    fn start(&mut self, sink: MessageSink) -> Result<()> {
        let backlog = {
            let mut peer = lock(&self.peer);
            peer.sink = Some(Arc::clone(&sink));
            std::mem::take(&mut peer.backlog)
        };
        for message in backlog {
            sink(message);
        }
        Ok(())
    }

    fn send(&mut self, command: DaemonCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DaemonError::Disconnected.into())
    }

    fn describe(&self) -> String {
        "in-process daemon".to_string()
    }
}

impl ChannelDaemon {
    /// Deliver a message to the coordinator
    pub fn send(&self, message: DaemonMessage) {
        let sink = {
            let mut peer = lock(&self.peer);
            match &peer.sink {
                Some(sink) => Arc::clone(sink),
                None => {
                    peer.backlog.push(message);
                    return;
                }
            }
        };
        sink(message);
    }

    /// Next command, waiting for one
    pub async fn recv(&mut self) -> Option<DaemonCommand> {
        self.commands.recv().await
    }

    /// Next command, if one is queued
    pub fn try_recv(&mut self) -> Option<DaemonCommand> {
        self.commands.try_recv().ok()
    }

    /// Every queued command
    pub fn drain(&mut self) -> Vec<DaemonCommand> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_sink() -> (MessageSink, Arc<Mutex<Vec<DaemonMessage>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&received);
        let sink: MessageSink = Arc::new(move |message| store.lock().unwrap().push(message));
        (sink, received)
    }

    #[test]
    fn messages_before_start_are_delivered_on_start() {
        let (mut transport, daemon) = ChannelTransport::pair();
        daemon.send(DaemonMessage::Ready);

        let (sink, received) = collecting_sink();
        transport.start(sink).unwrap();
        daemon.send(DaemonMessage::ShutdownComplete);

        assert_eq!(
            *received.lock().unwrap(),
            [DaemonMessage::Ready, DaemonMessage::ShutdownComplete]
        );
    }

    #[test]
    fn commands_reach_the_daemon_side() {
        let (mut transport, mut daemon) = ChannelTransport::pair();
        transport.send(DaemonCommand::Shutdown).unwrap();
        assert_eq!(daemon.drain(), [DaemonCommand::Shutdown]);
        assert!(daemon.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_waits_for_commands() {
        let (mut transport, mut daemon) = ChannelTransport::pair();
        transport.send(DaemonCommand::Shutdown).unwrap();
        assert_eq!(daemon.recv().await, Some(DaemonCommand::Shutdown));
    }

    #[test]
    fn send_after_daemon_dropped_fails() {
        let (mut transport, daemon) = ChannelTransport::pair();
        drop(daemon);
        let err = transport.send(DaemonCommand::Shutdown).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Daemon(DaemonError::Disconnected)
        ));
    }
}
