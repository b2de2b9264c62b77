//! The coordinator state owned by the event loop.
//!
//! [`Backend`] is the `S` of `EventLoop<S>`: every timer, idle call and daemon
//! message runs with `&mut Backend`, so the registry of [`RemoteDownloader`]s and
//! the [`DownloadStateManager`] are only ever touched from the loop thread.
//!
//! Daemon startup and shutdown live in [`lifecycle`].

mod lifecycle;


pub use lifecycle::Phase;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, watch};

use crate::config::{CoordinatorConfig, Settings};
use crate::consumer::DownloadConsumer;
use crate::daemon::{DaemonMessage, DaemonTransport};
use crate::downloader::{DownloaderContext, RemoteDownloader, StatusDisposition};
use crate::error::{DownloadError, Error, Result};
use crate::eventloop::LoopHandle;
use crate::probe::HeaderProbe;
use crate::state_manager::{DownloadStateManager, StateManagerHost};
use crate::status::StatusReport;
use crate::store::DownloaderStore;
use crate::types::{
    BITTORRENT_CONTENT_TYPE, ContentType, DownloadState, DownloaderId, Event, ItemId,
    MAGNET_CONTENT_TYPE,
};
use crate::utils::{file_url_path, is_magnet_uri, is_torrent_file, remove_path};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

type ShutdownCallback = Box<dyn FnOnce(&mut Backend) + Send>;

/// Registry of downloaders plus everything they need, owned by the loop
pub struct Backend {
    handle: LoopHandle<Backend>,
    manager: DownloadStateManager,
    store: Box<dyn DownloaderStore>,
    downloaders: BTreeMap<DownloaderId, RemoteDownloader>,
    settings: watch::Receiver<Settings>,
    upstream_torrent_limit: usize,
    config: CoordinatorConfig,
    probe: Arc<dyn HeaderProbe>,
    events: broadcast::Sender<Event>,
    phase: Phase,
    shutdown_callback: Option<ShutdownCallback>,
}

impl StateManagerHost for Backend {
    fn state_manager(&mut self) -> &mut DownloadStateManager {
        &mut self.manager
    }
}

impl Backend {
    /// Build the backend and restore every stored downloader
    ///
    /// Restored downloaders are idle until
    /// [`startup_downloader`](Self::startup_downloader) brings the daemon up.
    ///
    /// # Arguments
    ///
    /// * `handle` - Handle of the loop that will own the backend
    /// * `transport` - Connection to the worker daemon
    /// * `store` - Persistent downloader records
    /// * `probe` - Header probe for content-type discovery
    /// * `config` - Coordinator timings
    /// * `settings` - User preferences, re-read at every decision point
    pub fn new(
        handle: LoopHandle<Backend>,
        transport: Box<dyn DaemonTransport>,
        store: Box<dyn DownloaderStore>,
        probe: Arc<dyn HeaderProbe>,
        config: CoordinatorConfig,
        settings: watch::Receiver<Settings>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = DownloadStateManager::new(transport, config.update_interval, events.clone());
        let upstream_torrent_limit = settings.borrow().upstream_torrent_limit;

        let mut backend = Self {
            handle,
            manager,
            store,
            downloaders: BTreeMap::new(),
            settings,
            upstream_torrent_limit,
            config,
            probe,
            events,
            phase: Phase::Idle,
            shutdown_callback: None,
        };

        let records = backend.store.load_all();
        let (downloaders, mut ctx) = backend.parts();
        for record in records {
            let downloader = RemoteDownloader::restore(&mut ctx, record);
            downloaders.insert(downloader.id(), downloader);
        }
        tracing::info!(count = backend.downloaders.len(), "restored downloaders");
        backend
    }

    fn parts(&mut self) -> (&mut BTreeMap<DownloaderId, RemoteDownloader>, DownloaderContext<'_>) {
        let settings = self.settings.borrow().clone();
        (
            &mut self.downloaders,
            DownloaderContext {
                manager: &mut self.manager,
                store: self.store.as_mut(),
                settings,
                config: &self.config,
                handle: &self.handle,
                probe: &self.probe,
                events: &self.events,
            },
        )
    }

    /// Run `f` on the downloader with this id
    ///
    /// Returns `Ok(None)` when no such downloader exists (it may have been
    /// removed since a timer referencing it was scheduled).
    pub fn with_downloader<T>(
        &mut self,
        id: DownloaderId,
        f: impl FnOnce(&mut RemoteDownloader, &mut DownloaderContext<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        let (downloaders, mut ctx) = self.parts();
        match downloaders.get_mut(&id) {
            Some(downloader) => f(downloader, &mut ctx).map(Some),
            None => Ok(None),
        }
    }

    fn require<T>(
        &mut self,
        id: DownloaderId,
        f: impl FnOnce(&mut RemoteDownloader, &mut DownloaderContext<'_>) -> Result<T>,
    ) -> Result<T> {
        self.with_downloader(id, f)?
            .ok_or_else(|| Error::Download(DownloadError::NotFound { id: id.into() }))
    }

    /// The downloader with this id
    pub fn downloader(&self, id: DownloaderId) -> Option<&RemoteDownloader> {
        self.downloaders.get(&id)
    }

    /// Every downloader, ordered by id
    pub fn downloaders(&self) -> impl Iterator<Item = &RemoteDownloader> {
        self.downloaders.values()
    }

    /// Subscribe to coordinator events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Seeding limit the backend last applied
    pub fn upstream_torrent_limit(&self) -> usize {
        self.upstream_torrent_limit
    }

    /// Handle of the loop that owns this backend
    pub fn handle(&self) -> &LoopHandle<Backend> {
        &self.handle
    }

    /// The command coalescer
    pub fn manager(&self) -> &DownloadStateManager {
        &self.manager
    }

    /// Aggregate (download, upload) rate of every active transfer
    pub fn total_rates(&self) -> (f64, f64) {
        (self.manager.total_down_rate, self.manager.total_up_rate)
    }

    /// Pause a download
    pub fn pause(&mut self, id: DownloaderId) -> Result<()> {
        self.require(id, |downloader, ctx| downloader.pause(ctx))
    }

    /// Continue or retry a download
    pub fn start(&mut self, id: DownloaderId) -> Result<()> {
        self.require(id, |downloader, ctx| downloader.start(ctx))
    }

    /// Stop a download, deleting its data when `delete` is set
    pub fn stop(&mut self, id: DownloaderId, delete: bool) -> Result<()> {
        self.require(id, |downloader, ctx| downloader.stop(ctx, delete))
    }

    /// Start seeding a finished torrent
    pub fn start_upload(&mut self, id: DownloaderId) -> Result<()> {
        self.require(id, |downloader, ctx| downloader.start_upload(ctx))?;
        self.kill_uploaders()
    }

    /// Stop seeding
    pub fn stop_upload(&mut self, id: DownloaderId) -> Result<()> {
        self.require(id, |downloader, ctx| downloader.stop_upload(ctx))
    }

    /// Pause seeding
    pub fn pause_upload(&mut self, id: DownloaderId) -> Result<()> {
        self.require(id, |downloader, ctx| downloader.pause_upload(ctx))
    }

    /// Move a download into `directory`
    pub fn migrate(&mut self, id: DownloaderId, directory: &Path) -> Result<()> {
        self.require(id, |downloader, ctx| downloader.migrate(ctx, directory))
    }

    /// Activity text of a download that has not produced data yet
    pub fn startup_activity(&mut self, id: DownloaderId) -> Result<String> {
        self.require(id, |downloader, ctx| Ok(downloader.startup_activity(ctx)))
    }

    /// Remove a download and its record, deleting its data unless told otherwise
    pub fn remove_downloader(&mut self, id: DownloaderId, delete_files: bool) -> Result<()> {
        self.require(id, |downloader, ctx| {
            downloader.set_delete_files(delete_files);
            downloader.remove(ctx)
        })?;
        self.downloaders.remove(&id);
        Ok(())
    }

    /// Pause every active download
    pub fn pause_all(&mut self) -> Result<()> {
        self.manager.set_bulk_mode();
        for id in self.ids_in(&[DownloadState::Downloading, DownloadState::Offline]) {
            self.pause(id)?;
        }
        Ok(())
    }

    /// Resume every paused download
    pub fn resume_all(&mut self) -> Result<()> {
        self.manager.set_bulk_mode();
        for id in self.ids_in(&[DownloadState::Paused]) {
            self.start(id)?;
        }
        Ok(())
    }

    /// Stop every unfinished download and delete its partial data
    pub fn cancel_all(&mut self) -> Result<()> {
        self.manager.set_bulk_mode();
        let unfinished = [
            DownloadState::Downloading,
            DownloadState::Paused,
            DownloadState::Offline,
        ];
        for id in self.ids_in(&unfinished) {
            self.stop(id, true)?;
        }
        Ok(())
    }

    fn ids_in(&self, states: &[DownloadState]) -> Vec<DownloaderId> {
        self.downloaders
            .values()
            .filter(|downloader| states.contains(&downloader.state()))
            .map(RemoteDownloader::id)
            .collect()
    }

    /// Route a status report to its downloader
    ///
    /// When the report turns a download into an automatic seeder, the seeding
    /// limit is enforced right away.
    pub fn update_status(&mut self, report: StatusReport, cmd_done: bool) -> Result<StatusDisposition> {
        let Some(id) = self
            .downloaders
            .values()
            .find(|downloader| downloader.dlid() == &report.dlid)
            .map(RemoteDownloader::id)
        else {
            tracing::debug!(dlid = %report.dlid, "status update for unknown download");
            return Ok(StatusDisposition::Untracked);
        };

        let was_auto_uploader = self
            .downloaders
            .get(&id)
            .is_some_and(RemoteDownloader::is_auto_uploader);
        let disposition = self
            .with_downloader(id, |downloader, ctx| {
                downloader.update_status(ctx, report, cmd_done, Instant::now())
            })?
            .unwrap_or(StatusDisposition::Untracked);

        let is_auto_uploader = self
            .downloaders
            .get(&id)
            .is_some_and(RemoteDownloader::is_auto_uploader);
        if is_auto_uploader && !was_auto_uploader {
            self.kill_uploaders()?;
        }
        Ok(disposition)
    }

    /// Handle one message from the daemon
    pub fn on_daemon_message(&mut self, message: DaemonMessage) -> Result<()> {
        match message {
            DaemonMessage::Ready => self.on_daemon_ready(),
            DaemonMessage::Status { cmd_done, status } => {
                self.update_status(status, cmd_done).map(|_| ())
            }
            DaemonMessage::ShutdownComplete => {
                self.finish_shutdown();
                Ok(())
            }
            DaemonMessage::Error { message } => {
                tracing::error!(message = %message, "download daemon error");
                self.events
                    .send(Event::DaemonError {
                        message: message.clone(),
                    })
                    .ok();
                if self.phase == Phase::ShuttingDown {
                    self.finish_shutdown();
                }
                Ok(())
            }
        }
    }

    /// Find or create the downloader for `item`, attaching the item to it
    ///
    /// An existing downloader is reused when the item already references one or
    /// when one was created for the same URL. `file://` URLs must name a torrent
    /// file; one that cannot be read yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedUrl`] for a `file://` URL that is not a torrent.
    pub fn get_downloader_for_item(
        &mut self,
        item: Box<dyn DownloadConsumer>,
    ) -> Result<Option<DownloaderId>> {
        let url = item.url();
        let existing = item
            .downloader_id()
            .filter(|id| self.downloaders.contains_key(id))
            .or_else(|| {
                self.store
                    .find_by_url(&url)
                    .filter(|id| self.downloaders.contains_key(id))
            });
        if let Some(id) = existing {
            self.require(id, |downloader, ctx| {
                downloader.add_item(ctx, item);
                Ok(())
            })?;
            return Ok(Some(id));
        }

        let channel_name = item.channel_name().filter(|name| !name.is_empty());
        let content_type = if url.starts_with("file://") {
            let path = file_url_path(&url)?;
            match is_torrent_file(&path) {
                Ok(true) => ContentType::Known(BITTORRENT_CONTENT_TYPE.to_string()),
                Ok(false) => return Err(Error::UnsupportedUrl(url)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read torrent file");
                    return Ok(None);
                }
            }
        } else if is_magnet_uri(&url) {
            ContentType::Known(MAGNET_CONTENT_TYPE.to_string())
        } else if item.enclosure_type().as_deref() == Some(BITTORRENT_CONTENT_TYPE) {
            ContentType::Known(BITTORRENT_CONTENT_TYPE.to_string())
        } else {
            ContentType::Pending
        };

        let (downloaders, mut ctx) = self.parts();
        let downloader =
            RemoteDownloader::create(&mut ctx, url, Some(item), content_type, channel_name)?;
        let id = downloader.id();
        downloaders.insert(id, downloader);
        Ok(Some(id))
    }

    /// Detach an item; the downloader goes away with its last item
    pub fn remove_item(&mut self, id: DownloaderId, item_id: ItemId) -> Result<()> {
        let removed = self
            .with_downloader(id, |downloader, ctx| downloader.remove_item(ctx, item_id))?
            .unwrap_or(false);
        if removed {
            self.downloaders.remove(&id);
        }
        Ok(())
    }

    /// Stop automatic seeders beyond the configured limit; the oldest keep their slots
    pub fn kill_uploaders(&mut self) -> Result<()> {
        let limit = self.settings.borrow().upstream_torrent_limit;
        let excess: Vec<DownloaderId> = self
            .downloaders
            .values()
            .filter(|downloader| downloader.is_auto_uploader())
            .map(RemoteDownloader::id)
            .skip(limit)
            .collect();
        for id in excess {
            tracing::debug!(id = %id, limit, "too many automatic uploads, stopping one");
            self.stop_upload(id)?;
        }
        Ok(())
    }

    /// Re-read the settings after a change
    pub fn on_settings_changed(&mut self) -> Result<()> {
        let limit = self.settings.borrow_and_update().upstream_torrent_limit;
        if limit != self.upstream_torrent_limit {
            self.upstream_torrent_limit = limit;
            self.kill_uploaders()?;
        }
        Ok(())
    }

    /// Delete partial downloads no downloader refers to anymore
    pub fn cleanup_incomplete_downloads(&self) {
        let settings = self.settings.borrow().clone();
        let dir = settings.incomplete_downloads_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let in_use: HashSet<PathBuf> = self
            .downloaders
            .values()
            .filter(|downloader| {
                !matches!(downloader.state(), DownloadState::Stopped | DownloadState::Failed)
            })
            .filter_map(RemoteDownloader::filename)
            .map(|filename| {
                if filename.is_absolute() {
                    filename.to_path_buf()
                } else {
                    dir.join(filename)
                }
            })
            .collect();

        for entry in entries.flatten() {
            let path = entry.path();
            if in_use.contains(&path) {
                continue;
            }
            match remove_path(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed incomplete download"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not remove incomplete download")
                }
            }
        }
    }
}
