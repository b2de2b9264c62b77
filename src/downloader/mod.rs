//! Remote download proxy: one tracked download or upload handled by the worker daemon.
//!
//! The `RemoteDownloader` methods are organized by domain:
//! - [`status_update`] - Reconciliation of daemon status pushes (staleness, rate limiting)
//! - [`control`] - Pause/stop/start/seeding commands and restarts
//! - [`files`] - Deleting and migrating downloaded files
//!
//! A downloader never blocks and never owns the loop: every operation takes a
//! [`DownloaderContext`] with the pieces of the [`Backend`] it needs.

mod control;
mod files;
mod status_update;


pub use status_update::StatusDisposition;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::backend::Backend;
use crate::config::{CoordinatorConfig, Settings};
use crate::consumer::DownloadConsumer;
use crate::error::{DownloadError, Error, Result};
use crate::eventloop::{CallHandle, LoopHandle};
use crate::probe::HeaderProbe;
use crate::state_manager::{DownloadStateManager, StatusSink};
use crate::status::DownloadStatus;
use crate::store::{DownloaderRecord, DownloaderStore};
use crate::types::{
    ContentType, Dlid, DownloadState, DownloadType, DownloaderId, Event, ItemId,
};
use crate::utils::time_string;

/// The parts of the [`Backend`] a downloader operation may touch
pub struct DownloaderContext<'a> {
    pub(crate) manager: &'a mut DownloadStateManager,
    pub(crate) store: &'a mut dyn DownloaderStore,
    pub(crate) settings: Settings,
    pub(crate) config: &'a CoordinatorConfig,
    pub(crate) handle: &'a LoopHandle<Backend>,
    pub(crate) probe: &'a Arc<dyn HeaderProbe>,
    pub(crate) events: &'a broadcast::Sender<Event>,
}

impl DownloaderContext<'_> {
    /// Generate an identifier no stored or registered download uses
    pub(crate) fn generate_dlid(&self) -> Dlid {
        Dlid::generate(|candidate| {
            self.store.find_by_dlid(candidate).is_some() || self.manager.has_download(candidate)
        })
    }

    fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }
}

/// One download (or seeding torrent) run by the worker daemon
pub struct RemoteDownloader {
    id: DownloaderId,
    dlid: Dlid,
    orig_url: String,
    url: String,
    content_type: ContentType,
    channel_name: Option<String>,
    state: DownloadState,
    status: DownloadStatus,
    metainfo: Option<Vec<u8>>,
    manual_upload: bool,
    main_item_id: Option<ItemId>,
    child_deleted: bool,
    delete_files: bool,
    items: Vec<Box<dyn DownloadConsumer>>,
    status_updates_frozen: bool,
    last_update: Instant,
    save_later: Option<CallHandle>,
    retry_time_update: Option<CallHandle>,
}

impl StatusSink for RemoteDownloader {
    fn dlid(&self) -> &Dlid {
        &self.dlid
    }

    fn set_status_updates_frozen(&mut self, frozen: bool) {
        self.status_updates_frozen = frozen;
    }
}

impl RemoteDownloader {
    /// Create a downloader for `url` and start it
    ///
    /// With [`ContentType::Pending`] the URL's headers are probed on the thread
    /// pool first; otherwise the download is queued right away. The new record
    /// is persisted before this returns.
    pub fn create(
        ctx: &mut DownloaderContext<'_>,
        url: String,
        item: Option<Box<dyn DownloadConsumer>>,
        content_type: ContentType,
        channel_name: Option<String>,
    ) -> Result<Self> {
        let id = ctx.store.allocate_id();
        let dlid = ctx.generate_dlid();
        let mut downloader = Self {
            id,
            dlid,
            orig_url: url.clone(),
            url,
            content_type,
            channel_name,
            state: DownloadState::Downloading,
            status: DownloadStatus::default(),
            metainfo: None,
            manual_upload: false,
            main_item_id: None,
            child_deleted: false,
            delete_files: true,
            items: Vec::new(),
            status_updates_frozen: false,
            last_update: Instant::now(),
            save_later: None,
            retry_time_update: None,
        };
        tracing::debug!(id = %id, dlid = %downloader.dlid, url = %downloader.url, "creating downloader");

        if let Some(item) = item {
            downloader.add_item(ctx, item);
        }
        downloader.signal_change(ctx, true, false);

        if downloader.content_type == ContentType::Pending {
            downloader.get_content_type(ctx)?;
        } else {
            downloader.run_downloader(ctx)?;
        }
        Ok(downloader)
    }

    /// Rebuild a downloader from its persisted record
    ///
    /// Transfer rates and the ETA are reset, and the legacy `noid` identifier is
    /// replaced by a fresh one.
    pub fn restore(ctx: &mut DownloaderContext<'_>, record: DownloaderRecord) -> Self {
        let mut downloader = Self {
            id: record.id,
            dlid: record.dlid,
            orig_url: record.orig_url,
            url: record.url,
            content_type: record.content_type,
            channel_name: record.channel_name,
            state: record.state,
            status: record.status,
            metainfo: record.metainfo,
            manual_upload: record.manual_upload,
            main_item_id: record.main_item_id,
            child_deleted: record.child_deleted,
            delete_files: true,
            items: Vec::new(),
            status_updates_frozen: false,
            last_update: Instant::now(),
            save_later: None,
            retry_time_update: None,
        };
        if downloader.dlid.is_placeholder() {
            downloader.dlid = ctx.generate_dlid();
        }
        downloader.status.rate = Some(0.0);
        downloader.status.up_rate = Some(0.0);
        downloader.status.eta = Some(0);
        downloader.recalc_state();
        downloader
    }

    /// Snapshot of the persisted fields
    pub fn record(&self) -> DownloaderRecord {
        DownloaderRecord {
            id: self.id,
            dlid: self.dlid.clone(),
            orig_url: self.orig_url.clone(),
            url: self.url.clone(),
            content_type: self.content_type.clone(),
            channel_name: self.channel_name.clone(),
            state: self.state,
            status: self.status.clone(),
            metainfo: self.metainfo.clone(),
            manual_upload: self.manual_upload,
            main_item_id: self.main_item_id,
            child_deleted: self.child_deleted,
        }
    }

    /// Persistent id
    pub fn id(&self) -> DownloaderId {
        self.id
    }

    /// Current download identifier
    pub fn dlid(&self) -> &Dlid {
        &self.dlid
    }

    /// URL being downloaded (after redirects)
    pub fn url(&self) -> &str {
        &self.url
    }

    /// URL the downloader was created for
    pub fn orig_url(&self) -> &str {
        &self.orig_url
    }

    /// Visible state
    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Last accepted status blob
    pub fn status(&self) -> &DownloadStatus {
        &self.status
    }

    /// Probed content type
    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    /// BitTorrent metadata, once the daemon sent it
    pub fn metainfo(&self) -> Option<&[u8]> {
        self.metainfo.as_deref()
    }

    /// Channel the download belongs to
    pub fn channel_name(&self) -> Option<&str> {
        self.channel_name.as_deref()
    }

    /// Whether seeding was started by the user
    pub fn manual_upload(&self) -> bool {
        self.manual_upload
    }

    /// Item the download was first requested for
    pub fn main_item_id(&self) -> Option<ItemId> {
        self.main_item_id
    }

    /// Ids of every attached consumer
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|item| item.id()).collect()
    }

    /// Whether a command is queued and unacknowledged
    pub fn status_updates_frozen(&self) -> bool {
        self.status_updates_frozen
    }

    /// Whether the download reached a finished-like state
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Seeding without the user having asked for it
    pub fn is_auto_uploader(&self) -> bool {
        self.state == DownloadState::Uploading && !self.manual_upload
    }

    /// `bittorrent` for torrent files and magnet links, `http` otherwise
    pub fn get_type(&self) -> DownloadType {
        if self.content_type.is_bittorrent() {
            DownloadType::Bittorrent
        } else {
            DownloadType::Http
        }
    }

    /// Download rate in bytes per second
    pub fn rate(&self) -> f64 {
        self.status.rate.unwrap_or(0.0)
    }

    /// Estimated seconds remaining
    pub fn eta(&self) -> i64 {
        self.status.eta.unwrap_or(0)
    }

    /// Total size in bytes, -1 when unknown
    pub fn total_size(&self) -> i64 {
        self.status.total_size.unwrap_or(-1)
    }

    /// Bytes downloaded so far
    pub fn current_size(&self) -> i64 {
        self.status.current_size.unwrap_or(0)
    }

    /// Where the daemon writes the download
    pub fn filename(&self) -> Option<&Path> {
        self.status.filename.as_deref()
    }

    /// Bytes uploaded per byte downloaded, 0 before anything was downloaded
    pub fn upload_ratio(&self) -> f64 {
        let size = self.current_size();
        if size == 0 {
            return 0.0;
        }
        self.status.uploaded.unwrap_or(0) as f64 / size as f64
    }

    /// Long failure description; only meaningful in [`DownloadState::Failed`]
    pub fn reason_failed(&self) -> Result<&str> {
        self.require_failed("reason_failed")?;
        Ok(self.status.reason_failed.as_deref().unwrap_or("Unknown"))
    }

    /// Short failure description; only meaningful in [`DownloadState::Failed`]
    pub fn short_reason_failed(&self) -> Result<&str> {
        self.require_failed("short_reason_failed")?;
        Ok(self.status.short_reason_failed.as_deref().unwrap_or("Unknown"))
    }

    fn require_failed(&self, operation: &str) -> Result<()> {
        if self.state != DownloadState::Failed {
            return Err(Error::Download(DownloadError::InvalidState {
                id: self.id.into(),
                operation: operation.to_string(),
                current_state: self.state.to_string(),
            }));
        }
        Ok(())
    }

    /// Activity text shown while the download has not produced data yet
    ///
    /// When the daemon is waiting to retry, the text counts down; a one-shot
    /// timer re-signals the downloader so the countdown gets redrawn.
    pub fn startup_activity(&mut self, ctx: &mut DownloaderContext<'_>) -> String {
        if let Some(activity) = &self.status.activity {
            return activity.clone();
        }
        let retrying = self.status.retry_count.unwrap_or(-1) > -1;
        match self.status.retry_time {
            Some(retry_time) if retrying => {
                if self.retry_time_update.is_none() {
                    let id = self.id;
                    self.retry_time_update = Some(ctx.handle.add_timeout(
                        ctx.config.retry_time_refresh,
                        "Updating retry time",
                        move |backend: &mut Backend, _| {
                            backend.with_downloader(id, |downloader, ctx| {
                                downloader.retry_time_update = None;
                                downloader.signal_change(ctx, false, true);
                                Ok(())
                            })?;
                            Ok(())
                        },
                    ));
                }
                let remaining = retry_time - Utc::now();
                match remaining.to_std() {
                    Ok(delta) if !delta.is_zero() => {
                        format!("no connection - retrying in {}", time_string(delta.as_secs()))
                    }
                    _ => "no connection - retrying soon".to_string(),
                }
            }
            _ => "starting up".to_string(),
        }
    }

    /// Delete the downloaded data when this downloader is removed (default: true)
    pub fn set_delete_files(&mut self, delete_files: bool) {
        self.delete_files = delete_files;
    }

    /// Set the channel name unless one is already known
    pub fn set_channel_name(&mut self, channel_name: Option<String>) {
        if self.channel_name.is_none() {
            self.channel_name = channel_name.filter(|name| !name.is_empty());
        }
    }

    /// Record that part of the torrent's data was deleted by the user
    pub fn set_child_deleted(&mut self, ctx: &mut DownloaderContext<'_>) {
        if !self.child_deleted {
            self.child_deleted = true;
            self.signal_change(ctx, true, false);
        }
    }

    /// Attach another consumer of the same file
    ///
    /// The first consumer becomes the main item.
    pub fn add_item(&mut self, ctx: &mut DownloaderContext<'_>, item: Box<dyn DownloadConsumer>) {
        let item_id = item.id();
        if self.items.iter().any(|existing| existing.id() == item_id) {
            return;
        }
        self.items.push(item);
        if self.main_item_id.is_none() {
            self.main_item_id = Some(item_id);
        }
        self.signal_change(ctx, true, true);
    }

    /// Detach a consumer; removing the last one removes the downloader
    ///
    /// Returns `true` when the downloader was removed and must be dropped. An
    /// item that is not attached is ignored.
    pub fn remove_item(&mut self, ctx: &mut DownloaderContext<'_>, item_id: ItemId) -> Result<bool> {
        let Some(index) = self.items.iter().position(|item| item.id() == item_id) else {
            tracing::warn!(id = %self.id, item = %item_id, "item is not attached to this download");
            return Ok(false);
        };
        self.items.remove(index);
        if self.items.is_empty() {
            self.remove(ctx)?;
            return Ok(true);
        }
        if self.main_item_id == Some(item_id) {
            self.main_item_id = self.items.first().map(|item| item.id());
            self.signal_change(ctx, true, true);
        }
        Ok(false)
    }

    /// Stop the download and delete its record
    ///
    /// Files are deleted too unless [`set_delete_files(false)`](Self::set_delete_files)
    /// was called.
    pub fn remove(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        self.cancel_save_later();
        self.cancel_retry_time_update();
        let delete = self.delete_files;
        self.stop(ctx, delete)?;
        if let Err(e) = ctx.store.delete(self.id) {
            tracing::error!(id = %self.id, error = %e, "failed to delete downloader record");
        }
        Ok(())
    }

    /// Persist now if a delayed save is pending
    pub fn save_now(&mut self, ctx: &mut DownloaderContext<'_>) {
        if ctx.store.exists(self.id) && self.save_later.is_some() {
            self.signal_change(ctx, true, false);
        }
    }

    /// Cancel the retry countdown refresh
    pub fn cancel_retry_time_update(&mut self) {
        if let Some(timer) = self.retry_time_update.take() {
            timer.cancel();
        }
    }

    /// Persist and/or notify consumers after a change
    ///
    /// Saving cancels a pending delayed save.
    pub(crate) fn signal_change(
        &mut self,
        ctx: &mut DownloaderContext<'_>,
        needs_save: bool,
        needs_signal_item: bool,
    ) {
        if needs_save {
            self.cancel_save_later();
            if let Err(e) = ctx.store.save(&self.record()) {
                tracing::error!(id = %self.id, dlid = %self.dlid, error = %e, "failed to save downloader");
            }
        }
        if needs_signal_item {
            ctx.emit(Event::DownloaderChanged {
                id: self.id,
                dlid: self.dlid.clone(),
                state: self.state,
            });
            self.notify_items(|item, downloader| item.on_downloader_changed(downloader));
        }
    }

    /// Save after the configured delay unless something saves sooner
    fn save_later_after_delay(&mut self, ctx: &mut DownloaderContext<'_>, delay: Duration) {
        if self.save_later.is_some() {
            return;
        }
        let id = self.id;
        self.save_later = Some(ctx.handle.add_timeout(
            delay,
            "Delayed RemoteDownloader save",
            move |backend: &mut Backend, _| {
                backend.with_downloader(id, |downloader, ctx| {
                    downloader.save_now(ctx);
                    Ok(())
                })?;
                Ok(())
            },
        ));
    }

    fn cancel_save_later(&mut self) {
        if let Some(timer) = self.save_later.take() {
            timer.cancel();
        }
    }

    /// Whether a delayed save is scheduled
    pub fn save_pending(&self) -> bool {
        self.save_later.is_some()
    }

    fn recalc_state(&mut self) {
        self.state = self.status.state.unwrap_or_default();
    }

    /// Contribution of this downloader to the (download, upload) rate totals
    fn rates(&self) -> (f64, f64) {
        match self.state {
            DownloadState::Downloading => (self.rate(), self.status.up_rate.unwrap_or(0.0)),
            DownloadState::Uploading => (0.0, self.status.up_rate.unwrap_or(0.0)),
            _ => (0.0, 0.0),
        }
    }

    fn before_changing_status(&self, ctx: &mut DownloaderContext<'_>) {
        let (down, up) = self.rates();
        ctx.manager.total_down_rate -= down;
        ctx.manager.total_up_rate -= up;
    }

    fn after_changing_status(&mut self, ctx: &mut DownloaderContext<'_>) {
        self.recalc_state();
        let (down, up) = self.rates();
        ctx.manager.total_down_rate += down;
        ctx.manager.total_up_rate += up;
    }

    /// Mutate the status blob, keeping the aggregate rate totals in step
    fn change_status(&mut self, ctx: &mut DownloaderContext<'_>, change: impl FnOnce(&mut DownloadStatus)) {
        self.before_changing_status(ctx);
        change(&mut self.status);
        self.after_changing_status(ctx);
    }

    fn set_state(&mut self, ctx: &mut DownloaderContext<'_>, state: DownloadState) {
        self.change_status(ctx, |status| status.state = Some(state));
    }

    fn notify_items(&mut self, mut notify: impl FnMut(&mut dyn DownloadConsumer, &RemoteDownloader)) {
        let mut items = std::mem::take(&mut self.items);
        for item in items.iter_mut() {
            notify(item.as_mut(), self);
        }
        self.items = items;
    }
}

impl std::fmt::Debug for RemoteDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDownloader")
            .field("id", &self.id)
            .field("dlid", &self.dlid)
            .field("url", &self.url)
            .field("state", &self.state)
            .field("frozen", &self.status_updates_frozen)
            .finish_non_exhaustive()
    }
}
