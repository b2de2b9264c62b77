//! Starting and stopping the worker daemon.

use std::sync::Arc;

use super::Backend;
use crate::daemon::{DaemonCommand, MessageSink};
use crate::error::Result;
use crate::types::{DownloaderId, Event};

/// Where the backend is in its daemon lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Daemon not started yet
    Idle,
    /// Daemon launched, waiting for it to report ready
    Starting,
    /// Daemon ready; commands flush every tick
    Running,
    /// Shutdown sent, waiting for the daemon to confirm
    ShuttingDown,
    /// Shut down
    Stopped,
}

impl Backend {
    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bring the daemon up
    ///
    /// Incomplete downloads nobody refers to are deleted first. Daemon messages
    /// are delivered to the loop as idle calls; the rest of the startup happens
    /// once the daemon reports ready.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports when the daemon cannot be launched.
    pub fn startup_downloader(&mut self) -> Result<()> {
        if self.phase != Phase::Idle {
            tracing::warn!(phase = ?self.phase, "download daemon already started");
            return Ok(());
        }
        self.cleanup_incomplete_downloads();

        let handle = self.handle.clone();
        let sink: MessageSink = Arc::new(move |message| {
            handle.add_idle("Download daemon message", move |backend: &mut Backend, _| {
                backend.on_daemon_message(message)
            });
        });
        self.manager.start_daemon(sink)?;
        self.phase = Phase::Starting;
        Ok(())
    }

    /// The daemon finished starting
    ///
    /// Applies the seeding limit, restarts stored transfers (their restores are
    /// sent as one startup batch) and starts the recurring command flush.
    pub(crate) fn on_daemon_ready(&mut self) -> Result<()> {
        if self.phase != Phase::Starting {
            tracing::warn!(phase = ?self.phase, "unexpected daemon ready message");
            return Ok(());
        }
        tracing::info!("download daemon ready");

        self.kill_uploaders()?;
        let ids: Vec<DownloaderId> = self.downloaders.keys().copied().collect();
        for id in ids {
            let restarted = self.with_downloader(id, |downloader, ctx| {
                downloader.restart_on_startup_if_needed(ctx)
            });
            if let Err(e) = restarted {
                tracing::error!(id = %id, error = %e, "failed to restart download");
            }
        }

        self.manager.set_daemon_started(true);
        if let Err(e) = self.manager.send_initial_updates() {
            tracing::error!(error = %e, "failed to send startup commands");
        }
        let handle = self.handle.clone();
        self.manager.start_updates(&handle);
        self.phase = Phase::Running;
        self.events.send(Event::DaemonReady).ok();
        Ok(())
    }

    /// Shut the daemon down and call `callback` once it is gone
    ///
    /// Queued commands are flushed first. When the daemon never became ready
    /// the callback runs immediately; otherwise it runs when the daemon confirms
    /// (or reports an error). Pending saves are written right before the
    /// callback, so status pushed while the daemon winds down is kept.
    pub fn shutdown_downloader<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut Backend) + Send + 'static,
    {
        match self.phase {
            Phase::Running => {
                self.shutdown_callback = Some(Box::new(callback));
                self.phase = Phase::ShuttingDown;
                if let Err(e) = self.manager.send_updates() {
                    tracing::warn!(error = %e, "failed to flush commands before shutdown");
                }
                self.manager.stop_updates();
                if let Err(e) = self.manager.send_command(DaemonCommand::Shutdown) {
                    tracing::warn!(error = %e, "could not ask the daemon to shut down");
                    self.finish_shutdown();
                }
            }
            Phase::ShuttingDown => {
                self.shutdown_callback = Some(Box::new(callback));
            }
            Phase::Starting => {
                self.manager.send_command(DaemonCommand::Shutdown).ok();
                self.shutdown_callback = Some(Box::new(callback));
                self.finish_shutdown();
            }
            Phase::Idle | Phase::Stopped => {
                self.shutdown_callback = Some(Box::new(callback));
                self.finish_shutdown();
            }
        }
    }

    /// Write delayed saves and stop per-downloader timers
    pub(crate) fn shutdown_downloader_objects(&mut self) {
        let ids: Vec<DownloaderId> = self.downloaders.keys().copied().collect();
        for id in ids {
            let saved = self.with_downloader(id, |downloader, ctx| {
                downloader.save_now(ctx);
                downloader.cancel_retry_time_update();
                Ok(())
            });
            if let Err(e) = saved {
                tracing::error!(id = %id, error = %e, "failed to save download on shutdown");
            }
        }
        if let Err(e) = self.store.flush() {
            tracing::error!(error = %e, "failed to flush downloader records");
        }
    }

    pub(crate) fn finish_shutdown(&mut self) {
        if self.phase == Phase::Stopped && self.shutdown_callback.is_none() {
            return;
        }
        self.phase = Phase::Stopped;
        self.manager.set_daemon_started(false);
        self.shutdown_downloader_objects();
        tracing::info!("download daemon shut down");
        if let Some(callback) = self.shutdown_callback.take() {
            callback(self);
        }
        self.events.send(Event::Shutdown).ok();
    }
}
