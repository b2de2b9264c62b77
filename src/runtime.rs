//! The coordinator as one owned object: `init`, `run`, `shutdown`.
//!
//! [`Runtime`] owns the tokio runtime used for daemon pipes and database
//! writes, the event loop thread and the [`Backend`] living on it. Everything
//! that touches the backend is posted to that thread.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};

use crate::backend::Backend;
use crate::config::{Config, Settings};
use crate::daemon::{DaemonTransport, ProcessDaemon};
use crate::error::{Error, Result};
use crate::eventloop::{CallHandle, EventLoop, LoopHandle};
use crate::probe::{HeaderProbe, HttpProbe};
use crate::store::{DownloaderStore, MemoryStore, SqliteStore};
use crate::types::Event;

/// How long shutdown waits for the daemon to confirm before giving up on it
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the I/O runtime gets to finish queued writes on shutdown
const IO_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the event loop thread and everything running on it
pub struct Runtime {
    io: Option<tokio::runtime::Runtime>,
    handle: LoopHandle<Backend>,
    pending: Option<(EventLoop<Backend>, Backend)>,
    thread: Option<JoinHandle<Backend>>,
    settings: watch::Sender<Settings>,
    events: broadcast::Receiver<Event>,
}

impl Runtime {
    /// Build the coordinator from configuration
    ///
    /// Opens the SQLite store when `persistence.database_path` is set (keeping
    /// records in memory otherwise) and prepares the daemon child process. The
    /// event loop does not run until [`run`](Self::run).
    ///
    /// Must not be called from inside an async context.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if the I/O runtime,
    /// the database, the HTTP client or the event loop cannot be created.
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let io = io_runtime()?;

        let store: Box<dyn DownloaderStore> = match &config.persistence.database_path {
            Some(path) => Box::new(SqliteStore::open(path, io.handle().clone())?),
            None => Box::new(MemoryStore::new()),
        };
        let transport = Box::new(ProcessDaemon::new(
            config.daemon.clone(),
            io.handle().clone(),
        ));
        let probe = Arc::new(HttpProbe::new()?);

        Self::assemble(io, config, transport, store, probe)
    }

    /// Build the coordinator around caller-supplied collaborators
    ///
    /// # Arguments
    ///
    /// * `config` - Loop tuning, timings and initial settings; `daemon` and
    ///   `persistence` are ignored
    /// * `transport` - Connection to the worker daemon
    /// * `store` - Persistent downloader records
    /// * `probe` - Header probe for content-type discovery
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the event loop
    /// cannot be created.
    pub fn init_with(
        config: Config,
        transport: Box<dyn DaemonTransport>,
        store: Box<dyn DownloaderStore>,
        probe: Arc<dyn HeaderProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let io = io_runtime()?;
        Self::assemble(io, config, transport, store, probe)
    }

    fn assemble(
        io: tokio::runtime::Runtime,
        config: Config,
        transport: Box<dyn DaemonTransport>,
        store: Box<dyn DownloaderStore>,
        probe: Arc<dyn HeaderProbe>,
    ) -> Result<Self> {
        let event_loop = EventLoop::new(&config.event_loop)?;
        let handle = event_loop.handle();
        let (settings, settings_rx) = watch::channel(config.settings);
        let backend = Backend::new(
            handle.clone(),
            transport,
            store,
            probe,
            config.coordinator,
            settings_rx,
        );
        let events = backend.subscribe();
        tracing::info!(downloads = backend.downloaders().count(), "coordinator initialized");

        Ok(Self {
            io: Some(io),
            handle,
            pending: Some((event_loop, backend)),
            thread: None,
            settings,
            events,
        })
    }

    /// Start the event loop thread and bring the daemon up
    ///
    /// Returns once the thread is running; daemon startup continues on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime already ran or the thread cannot be
    /// spawned.
    pub fn run(&mut self) -> Result<()> {
        let (event_loop, backend) = self
            .pending
            .take()
            .ok_or_else(|| Error::Other("coordinator already running".into()))?;

        self.handle
            .add_idle("Start downloader", |backend: &mut Backend, _| {
                backend.startup_downloader()
            });
        self.thread = Some(event_loop.spawn(backend)?);
        tracing::info!("coordinator running");
        Ok(())
    }

    /// Whether [`run`](Self::run) started the loop thread
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Schedule `f` on the event loop thread
    pub fn post<F>(&self, name: &str, f: F) -> CallHandle
    where
        F: FnOnce(&mut Backend, &LoopHandle<Backend>) -> Result<()> + Send + 'static,
    {
        self.handle.add_idle(name, f)
    }

    /// Run `f` on the event loop thread and wait for its result
    ///
    /// Must not be called from the event loop thread itself or from inside an
    /// async context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] if the loop stopped before running `f`.
    pub fn call<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Backend) -> T + Send + 'static,
    {
        if !self.is_running() {
            return Err(Error::Other("coordinator is not running".into()));
        }
        if self.handle.is_quitting() {
            return Err(Error::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        self.handle.add_idle(name, move |backend: &mut Backend, _| {
            tx.send(f(backend)).ok();
            Ok(())
        });
        rx.blocking_recv().map_err(|_| Error::ShuttingDown)
    }

    /// Change user preferences
    ///
    /// The new settings are visible at the next decision point; a "config
    /// callback" on the loop re-applies the seeding limit when it changed.
    pub fn update_settings(&self, modify: impl FnOnce(&mut Settings)) {
        self.settings.send_modify(modify);
        self.handle
            .add_idle("config callback", |backend: &mut Backend, _| {
                backend.on_settings_changed()
            });
    }

    /// Current user preferences
    pub fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }

    /// Subscribe to coordinator events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.resubscribe()
    }

    /// Handle for scheduling work on the event loop
    pub fn handle(&self) -> &LoopHandle<Backend> {
        &self.handle
    }

    /// Shut the daemon down, stop the loop thread and release everything
    ///
    /// Blocks until the daemon confirms, or for at most ten seconds. Must not be
    /// called from inside an async context.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop thread panicked.
    pub fn shutdown(mut self) -> Result<()> {
        tracing::info!("shutting down coordinator");
        if let Some(thread) = self.thread.take() {
            self.handle
                .add_urgent_call("Shutdown downloader", |backend: &mut Backend, handle| {
                    let quit = handle.clone();
                    backend.shutdown_downloader(move |_| quit.quit());
                    Ok(())
                });
            self.handle.add_timeout(
                SHUTDOWN_TIMEOUT,
                "Shutdown timeout",
                |backend: &mut Backend, _| {
                    tracing::warn!("download daemon did not confirm shutdown in time");
                    backend.finish_shutdown();
                    Ok(())
                },
            );
            let backend = thread
                .join()
                .map_err(|_| Error::Other("event loop thread panicked".into()))?;
            drop(backend);
        } else if let Some((mut event_loop, mut backend)) = self.pending.take() {
            backend.shutdown_downloader_objects();
            event_loop.shutdown();
        }

        if let Some(io) = self.io.take() {
            io.shutdown_timeout(IO_SHUTDOWN_TIMEOUT);
        }
        tracing::info!("coordinator shut down");
        Ok(())
    }
}

fn io_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("coordinator-io")
        .enable_all()
        .build()
        .map_err(Error::Io)
}

/// Run the coordinator until a termination signal arrives, then shut it down
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use download_coordinator::{Config, Runtime, run_with_shutdown};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runtime = Runtime::init(Config::default())?;
///     run_with_shutdown(runtime)?;
///     Ok(())
/// }
/// ```
pub fn run_with_shutdown(mut runtime: Runtime) -> Result<()> {
    if !runtime.is_running() {
        runtime.run()?;
    }
    if let Some(io) = &runtime.io {
        io.block_on(wait_for_signal());
    }
    runtime.shutdown()
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::backend::Phase;
    use crate::daemon::{ChannelTransport, DaemonCommand, DaemonMessage};
    use crate::testing::{StaticProbe, record};
    use crate::types::{DownloadState, DownloaderId};

    fn runtime_with(records: Vec<crate::store::DownloaderRecord>) -> (Runtime, crate::daemon::ChannelDaemon) {
        let (transport, daemon) = ChannelTransport::pair();
        let runtime = Runtime::init_with(
            Config::default(),
            Box::new(transport),
            Box::new(MemoryStore::with_records(records)),
            Arc::new(StaticProbe::ok("video/mp4")),
        )
        .unwrap();
        (runtime, daemon)
    }

    fn wait_for(runtime: &Runtime, done: impl Fn(&Backend) -> bool + Send + Sync + Clone + 'static) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let check = done.clone();
            if runtime.call("test poll", move |backend| check(&*backend)).unwrap() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (transport, _daemon) = ChannelTransport::pair();
        let mut config = Config::default();
        config.event_loop.thread_pool_size = 0;
        let result = Runtime::init_with(
            config,
            Box::new(transport),
            Box::new(MemoryStore::new()),
            Arc::new(StaticProbe::ok("video/mp4")),
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn run_starts_daemon_and_shutdown_waits_for_it() {
        let (mut runtime, mut daemon) = runtime_with(vec![record(1, DownloadState::Downloading)]);
        let mut events = runtime.subscribe();
        runtime.run().unwrap();
        assert!(runtime.run().is_err());

        wait_for(&runtime, |backend| backend.phase() == Phase::Starting);
        daemon.send(DaemonMessage::Ready);
        wait_for(&runtime, |backend| backend.phase() == Phase::Running);

        // The stored transfer is restored in the startup batch
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut batch = None;
        while batch.is_none() && Instant::now() < deadline {
            batch = daemon.try_recv();
            std::thread::sleep(Duration::from_millis(10));
        }
        match batch {
            Some(DaemonCommand::Batch { commands }) => assert_eq!(commands.len(), 1),
            other => panic!("expected startup batch, got {other:?}"),
        }

        let confirm = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if let Some(DaemonCommand::Shutdown) = daemon.try_recv() {
                    daemon.send(DaemonMessage::ShutdownComplete);
                    return true;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            false
        });
        runtime.shutdown().unwrap();
        assert!(confirm.join().unwrap());

        let received: Vec<Event> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(received.contains(&Event::DaemonReady));
        assert!(received.contains(&Event::Shutdown));
    }

    #[test]
    fn settings_changes_reach_the_loop() {
        let (mut runtime, _daemon) = runtime_with(Vec::new());
        runtime.run().unwrap();

        runtime.update_settings(|settings| settings.upstream_torrent_limit = 2);
        assert_eq!(runtime.settings().upstream_torrent_limit, 2);
        wait_for(&runtime, |backend| backend.upstream_torrent_limit() == 2);

        runtime.shutdown().unwrap();
    }

    #[test]
    fn call_reaches_the_backend() {
        let (mut runtime, _daemon) = runtime_with(vec![record(4, DownloadState::Paused)]);
        assert!(runtime.call("too early", |_| ()).is_err());
        runtime.run().unwrap();

        let state = runtime
            .call("read state", |backend| {
                backend.downloader(DownloaderId(4)).map(|d| d.state())
            })
            .unwrap();
        assert_eq!(state, Some(DownloadState::Paused));

        runtime.shutdown().unwrap();
    }

    #[test]
    fn shutdown_without_run_releases_everything() {
        let (runtime, _daemon) = runtime_with(vec![record(1, DownloadState::Paused)]);
        runtime.shutdown().unwrap();
    }
}
