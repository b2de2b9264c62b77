//! Command coalescing for the worker daemon.
//!
//! Commands for one download identifier can be replaced by any later command,
//! except for a pause/resume pair: those cancel each other and nothing is sent.
//! Whatever survives is flushed to the daemon as a single batch once per tick.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::command::{Command, CommandKind};
use crate::daemon::{DaemonCommand, DaemonTransport, MessageSink};
use crate::error::{Error, Result};
use crate::eventloop::{CallHandle, LoopHandle};
use crate::types::{Dlid, DownloaderId, Event};

/// The part of a download proxy the coalescer needs to see
///
/// Queuing a command freezes status updates for the download until the daemon
/// replies; a cancelled pause/resume pair unfreezes it again.
pub trait StatusSink {
    /// Identifier commands are queued under
    fn dlid(&self) -> &Dlid;

    /// Set or clear the frozen flag
    fn set_status_updates_frozen(&mut self, frozen: bool);
}

/// Loop state that owns a [`DownloadStateManager`]
///
/// Lets the recurring flush timer reach the manager from inside the loop.
pub trait StateManagerHost {
    /// The coordinator's command coalescer
    fn state_manager(&mut self) -> &mut DownloadStateManager;
}

/// Buffers and deduplicates commands destined for the worker daemon
pub struct DownloadStateManager {
    commands: HashMap<Dlid, Command>,
    startup_commands: Option<HashMap<Dlid, Command>>,
    downloads: HashMap<Dlid, DownloaderId>,
    /// Sum of the download rate of every proxy in `downloading`
    pub total_down_rate: f64,
    /// Sum of the upload rate of every proxy in `downloading` or `uploading`
    pub total_up_rate: f64,
    bulk_mode: bool,
    daemon_started: bool,
    update_interval: Duration,
    transport: Box<dyn DaemonTransport>,
    event_tx: broadcast::Sender<Event>,
    update_timer: Option<CallHandle>,
}

impl DownloadStateManager {
    /// Create a manager that flushes through `transport` every `update_interval`
    pub fn new(
        transport: Box<dyn DaemonTransport>,
        update_interval: Duration,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            commands: HashMap::new(),
            startup_commands: Some(HashMap::new()),
            downloads: HashMap::new(),
            total_down_rate: 0.0,
            total_up_rate: 0.0,
            bulk_mode: false,
            daemon_started: false,
            update_interval,
            transport,
            event_tx,
            update_timer: None,
        }
    }

    /// Register `dlid` as known to the daemon
    pub fn add_download(&mut self, dlid: Dlid, id: DownloaderId) {
        self.downloads.insert(dlid, id);
    }

    /// Forget `dlid`; returns whether it was registered
    pub fn delete_download(&mut self, dlid: &Dlid) -> bool {
        self.downloads.remove(dlid).is_some()
    }

    /// The proxy registered under `dlid`
    pub fn get_download(&self, dlid: &Dlid) -> Option<DownloaderId> {
        self.downloads.get(dlid).copied()
    }

    /// Whether any identifier is registered
    pub fn has_download(&self, dlid: &Dlid) -> bool {
        self.downloads.contains_key(dlid)
    }

    /// Mark that a pause-all/resume-all/cancel-all is in progress
    pub fn set_bulk_mode(&mut self) {
        self.bulk_mode = true;
    }

    /// Whether the daemon has finished starting
    pub fn daemon_started(&self) -> bool {
        self.daemon_started
    }

    pub(crate) fn set_daemon_started(&mut self, started: bool) {
        self.daemon_started = started;
    }

    /// The command waiting for the next flush, if any
    pub fn pending_command(&self, dlid: &Dlid) -> Option<&Command> {
        self.commands.get(dlid)
    }

    /// Number of identifiers with a pending command
    pub fn pending_len(&self) -> usize {
        self.commands.len()
    }

    /// The RESTORE waiting for daemon startup, if any
    pub fn startup_command(&self, dlid: &Dlid) -> Option<&Command> {
        self.startup_commands.as_ref()?.get(dlid)
    }

    /// Queue `command` for the download behind `sink`
    ///
    /// Fails with [`Error::UnregisteredDownload`] unless
    /// [`add_download`](Self::add_download) was called for its identifier.
    pub fn queue(&mut self, sink: &mut dyn StatusSink, command: Command) -> Result<()> {
        let dlid = sink.dlid().clone();
        if !self.downloads.contains_key(&dlid) {
            return Err(Error::UnregisteredDownload { dlid });
        }
        let kind = command.kind();

        // Restores wait for the daemon; they are flushed once it is ready
        if kind == CommandKind::Restore && !self.daemon_started {
            self.startup_commands
                .get_or_insert_with(HashMap::new)
                .insert(dlid, command);
            return Ok(());
        }

        if let Some(pending) = self.commands.get(&dlid) {
            let pending = pending.kind();
            if pending.cancels(kind) {
                tracing::debug!(dlid = %dlid, pending = %pending, queued = %kind, "commands cancel out");
                self.commands.remove(&dlid);
                sink.set_status_updates_frozen(false);
                return Ok(());
            }
            if kind == CommandKind::Restore {
                tracing::info!(dlid = %dlid, pending = %pending, "not restoring active download");
                return Ok(());
            }
        }

        if kind != CommandKind::Restore {
            sink.set_status_updates_frozen(true);
        }
        self.commands.insert(dlid, command);
        Ok(())
    }

    /// Flush the pending table as one batch
    ///
    /// The table is always empty afterwards. With nothing to send in bulk mode a
    /// [`Event::SyncCommandComplete`] is emitted instead. Bulk mode is reset.
    pub fn send_updates(&mut self) -> Result<()> {
        let commands = std::mem::take(&mut self.commands);
        let result = if !commands.is_empty() {
            tracing::trace!(count = commands.len(), "sending download commands");
            self.send_batch(commands)
        } else {
            if self.bulk_mode {
                self.event_tx.send(Event::SyncCommandComplete).ok();
            }
            Ok(())
        };
        self.bulk_mode = false;
        result
    }

    /// Flush the restores queued before daemon startup, then drop that table for good
    pub fn send_initial_updates(&mut self) -> Result<()> {
        match self.startup_commands.take() {
            Some(commands) if !commands.is_empty() => {
                tracing::debug!(count = commands.len(), "sending startup restores");
                self.send_batch(commands)
            }
            _ => Ok(()),
        }
    }

    /// Schedule the recurring flush on `handle`
    ///
    /// Each tick flushes and schedules the next tick, even when sending failed.
    pub fn start_updates<S>(&mut self, handle: &LoopHandle<S>)
    where
        S: StateManagerHost + 'static,
    {
        let timer = handle.add_timeout(
            self.update_interval,
            "Send Download Command Updates",
            |state: &mut S, handle: &LoopHandle<S>| {
                let manager = state.state_manager();
                let result = manager.send_updates();
                manager.start_updates(handle);
                result
            },
        );
        if let Some(previous) = self.update_timer.replace(timer) {
            previous.cancel();
        }
    }

    /// Cancel the recurring flush
    pub fn stop_updates(&mut self) {
        if let Some(timer) = self.update_timer.take() {
            timer.cancel();
        }
    }

    /// Start the daemon transport
    pub fn start_daemon(&mut self, sink: MessageSink) -> Result<()> {
        tracing::debug!(transport = %self.transport.describe(), "starting download daemon");
        self.transport.start(sink)
    }

    /// Send a command outside the batch (migrate, shutdown)
    pub fn send_command(&mut self, command: DaemonCommand) -> Result<()> {
        self.transport.send(command)
    }

    fn send_batch(&mut self, commands: HashMap<Dlid, Command>) -> Result<()> {
        let commands: BTreeMap<Dlid, Command> = commands.into_iter().collect();
        self.transport.send(DaemonCommand::Batch { commands })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{PauseArgs, RestoreArgs, ResumeArgs, StopArgs};
    use crate::config::EventLoopConfig;
    use crate::daemon::{ChannelDaemon, ChannelTransport};
    use crate::eventloop::EventLoop;
    use crate::status::DownloadStatus;

    struct Sink {
        dlid: Dlid,
        frozen: bool,
    }

    impl Sink {
        fn new(dlid: &str) -> Self {
            Self {
                dlid: Dlid::from(dlid),
                frozen: false,
            }
        }
    }

    impl StatusSink for Sink {
        fn dlid(&self) -> &Dlid {
            &self.dlid
        }

        fn set_status_updates_frozen(&mut self, frozen: bool) {
            self.frozen = frozen;
        }
    }

    fn manager() -> (DownloadStateManager, ChannelDaemon, broadcast::Receiver<Event>) {
        let (transport, daemon) = ChannelTransport::pair();
        let (event_tx, event_rx) = broadcast::channel(16);
        let manager =
            DownloadStateManager::new(Box::new(transport), Duration::from_secs(1), event_tx);
        (manager, daemon, event_rx)
    }

    fn resume() -> Command {
        Command::Resume(ResumeArgs {
            url: "http://x/y.mp4".into(),
            content_type: None,
            channel_name: None,
        })
    }

    fn pause() -> Command {
        Command::Pause(PauseArgs { upload: false })
    }

    fn stop() -> Command {
        Command::Stop(StopArgs {
            upload: false,
            delete: false,
        })
    }

    fn restore() -> Command {
        Command::Restore(RestoreArgs {
            downloader: DownloadStatus::default(),
            metainfo: None,
        })
    }

    #[test]
    fn queue_requires_registration() {
        let (mut manager, _daemon, _events) = manager();
        let mut sink = Sink::new("D1");
        let err = manager.queue(&mut sink, pause()).unwrap_err();
        assert!(matches!(err, Error::UnregisteredDownload { dlid } if dlid.as_str() == "D1"));
        assert!(!sink.frozen);
    }

    #[test]
    fn pause_resume_pair_annihilates_and_unfreezes() {
        let (mut manager, mut daemon, _events) = manager();
        manager.set_daemon_started(true);
        let mut sink = Sink::new("D1");
        manager.add_download(sink.dlid.clone(), DownloaderId(1));

        manager.queue(&mut sink, resume()).unwrap();
        assert!(sink.frozen);
        manager.queue(&mut sink, pause()).unwrap();

        assert!(manager.pending_command(&sink.dlid).is_none());
        assert!(!sink.frozen);

        manager.send_updates().unwrap();
        assert!(daemon.drain().is_empty());
    }

    #[test]
    fn resume_after_pause_also_annihilates() {
        let (mut manager, _daemon, _events) = manager();
        let mut sink = Sink::new("D1");
        manager.add_download(sink.dlid.clone(), DownloaderId(1));
        manager.queue(&mut sink, pause()).unwrap();
        manager.queue(&mut sink, resume()).unwrap();
        assert_eq!(manager.pending_len(), 0);
        assert!(!sink.frozen);
    }

    #[test]
    fn later_command_supersedes_earlier() {
        let (mut manager, _daemon, _events) = manager();
        let mut sink = Sink::new("D1");
        manager.add_download(sink.dlid.clone(), DownloaderId(1));

        manager.queue(&mut sink, pause()).unwrap();
        manager.queue(&mut sink, stop()).unwrap();
        manager.queue(&mut sink, resume()).unwrap();

        assert_eq!(manager.pending_len(), 1);
        assert_eq!(
            manager.pending_command(&sink.dlid).map(Command::kind),
            Some(CommandKind::Resume)
        );
        assert!(sink.frozen);
    }

    #[test]
    fn restore_before_daemon_start_goes_to_startup_table() {
        let (mut manager, mut daemon, _events) = manager();
        let mut sink = Sink::new("D1");
        manager.add_download(sink.dlid.clone(), DownloaderId(1));

        manager.queue(&mut sink, restore()).unwrap();
        assert!(!sink.frozen);
        assert_eq!(manager.pending_len(), 0);
        assert!(manager.startup_command(&sink.dlid).is_some());

        manager.set_daemon_started(true);
        manager.send_initial_updates().unwrap();
        match daemon.drain().as_slice() {
            [DaemonCommand::Batch { commands }] => {
                assert_eq!(commands.len(), 1);
                assert_eq!(commands[&sink.dlid].kind(), CommandKind::Restore);
            }
            other => panic!("expected one batch, got {other:?}"),
        }

        // The startup table is gone for good
        assert!(manager.startup_command(&sink.dlid).is_none());
        manager.send_initial_updates().unwrap();
        assert!(daemon.drain().is_empty());
    }

    #[test]
    fn restore_is_dropped_when_something_is_pending() {
        let (mut manager, _daemon, _events) = manager();
        manager.set_daemon_started(true);
        let mut sink = Sink::new("D1");
        manager.add_download(sink.dlid.clone(), DownloaderId(1));

        manager.queue(&mut sink, pause()).unwrap();
        manager.queue(&mut sink, restore()).unwrap();
        assert_eq!(
            manager.pending_command(&sink.dlid).map(Command::kind),
            Some(CommandKind::Pause)
        );
        assert!(sink.frozen);
    }

    #[test]
    fn restore_after_start_does_not_freeze() {
        let (mut manager, _daemon, _events) = manager();
        manager.set_daemon_started(true);
        let mut sink = Sink::new("D1");
        manager.add_download(sink.dlid.clone(), DownloaderId(1));
        manager.queue(&mut sink, restore()).unwrap();
        assert!(!sink.frozen);
        assert_eq!(
            manager.pending_command(&sink.dlid).map(Command::kind),
            Some(CommandKind::Restore)
        );
    }

    #[test]
    fn send_updates_flushes_one_batch_and_empties_table() {
        let (mut manager, mut daemon, _events) = manager();
        let mut a = Sink::new("A");
        let mut b = Sink::new("B");
        manager.add_download(a.dlid.clone(), DownloaderId(1));
        manager.add_download(b.dlid.clone(), DownloaderId(2));
        manager.queue(&mut a, pause()).unwrap();
        manager.queue(&mut b, stop()).unwrap();

        manager.send_updates().unwrap();
        assert_eq!(manager.pending_len(), 0);
        let sent = daemon.drain();
        assert_eq!(sent.len(), 1);
        let DaemonCommand::Batch { commands } = &sent[0] else {
            panic!("expected batch, got {:?}", sent[0]);
        };
        assert_eq!(commands.keys().map(Dlid::as_str).collect::<Vec<_>>(), ["A", "B"]);
    }

    #[test]
    fn bulk_mode_without_commands_emits_sync_complete_once() {
        let (mut manager, mut daemon, mut events) = manager();
        manager.set_bulk_mode();
        manager.send_updates().unwrap();
        assert_eq!(events.try_recv().unwrap(), Event::SyncCommandComplete);
        assert!(daemon.drain().is_empty());

        manager.send_updates().unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn bulk_mode_with_commands_sends_batch_instead() {
        let (mut manager, mut daemon, mut events) = manager();
        let mut sink = Sink::new("A");
        manager.add_download(sink.dlid.clone(), DownloaderId(1));
        manager.set_bulk_mode();
        manager.queue(&mut sink, pause()).unwrap();
        manager.send_updates().unwrap();
        assert_eq!(daemon.drain().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn delete_download_reports_whether_registered() {
        let (mut manager, _daemon, _events) = manager();
        let dlid = Dlid::from("A");
        manager.add_download(dlid.clone(), DownloaderId(7));
        assert_eq!(manager.get_download(&dlid), Some(DownloaderId(7)));
        assert!(manager.delete_download(&dlid));
        assert!(!manager.delete_download(&dlid));
        assert!(manager.get_download(&dlid).is_none());
    }

    struct Host {
        manager: DownloadStateManager,
    }

    impl StateManagerHost for Host {
        fn state_manager(&mut self) -> &mut DownloadStateManager {
            &mut self.manager
        }
    }

    #[test]
    fn flush_timer_reschedules_itself_even_when_send_fails() {
        let (manager, daemon, _events) = manager();
        // A dropped daemon makes every send fail
        drop(daemon);
        let mut host = Host { manager };
        let config = EventLoopConfig::default();
        let mut event_loop: EventLoop<Host> = EventLoop::new(&config).unwrap();
        let handle = event_loop.handle();

        host.manager.update_interval = Duration::from_millis(10);
        let mut sink = Sink::new("A");
        host.manager.add_download(sink.dlid.clone(), DownloaderId(1));
        host.manager.queue(&mut sink, pause()).unwrap();
        host.manager.start_updates(&handle);

        let deadline = std::time::Instant::now() + Duration::from_millis(200);
        while std::time::Instant::now() < deadline {
            event_loop
                .run_once(&mut host, Some(Duration::from_millis(5)))
                .unwrap();
        }
        assert_eq!(host.manager.pending_len(), 0);
        let timer = host.manager.update_timer.clone().unwrap();
        assert!(timer.is_pending());

        host.manager.stop_updates();
        assert!(timer.is_canceled());
    }
}
