//! User-facing commands and (re)starting transfers.

use std::sync::Arc;

use super::{DownloaderContext, RemoteDownloader};
use crate::backend::Backend;
use crate::command::{Command, PauseArgs, RestoreArgs, ResumeArgs, StopArgs};
use crate::error::Result;
use crate::probe::HeaderInfo;
use crate::status::DownloadStatus;
use crate::types::{ContentType, DownloadState, DownloadType, Event, MAGNET_CONTENT_TYPE};
use crate::utils::is_magnet_uri;

impl RemoteDownloader {
    /// Pause the download
    pub fn pause(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        if ctx.manager.has_download(&self.dlid) {
            ctx.manager.queue(self, Command::Pause(PauseArgs { upload: false }))?;
        }
        self.set_state(ctx, DownloadState::Paused);
        self.signal_change(ctx, true, true);
        Ok(())
    }

    /// Stop the download, deleting the downloaded data when `delete` is set
    ///
    /// File deletion is best-effort; the downloader ends up `stopped` either way.
    pub fn stop(&mut self, ctx: &mut DownloaderContext<'_>, delete: bool) -> Result<()> {
        let active = matches!(
            self.state,
            DownloadState::Downloading
                | DownloadState::Uploading
                | DownloadState::Paused
                | DownloadState::Offline
        );
        if active && ctx.manager.has_download(&self.dlid) {
            ctx.manager
                .queue(self, Command::Stop(StopArgs { upload: false, delete }))?;
            ctx.manager.delete_download(&self.dlid);
        }
        if delete {
            self.delete_downloaded_files(ctx);
        }
        self.set_state(ctx, DownloadState::Stopped);
        self.signal_change(ctx, true, true);
        Ok(())
    }

    /// Continue a paused, stopped or offline download, or retry a failed one
    ///
    /// Retrying a failed download drops the redirected URL and every status key,
    /// and switches to a new identifier so late replies for the failed attempt
    /// are ignored.
    pub fn start(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        match self.state {
            DownloadState::Failed => {
                self.url = self.orig_url.clone();
                ctx.manager.delete_download(&self.dlid);
                self.dlid = ctx.generate_dlid();
                tracing::debug!(id = %self.id, dlid = %self.dlid, "retrying failed download");
                self.change_status(ctx, |status| *status = DownloadStatus::default());
                if self.content_type == ContentType::Pending {
                    self.get_content_type(ctx)?;
                } else {
                    self.run_downloader(ctx)?;
                }
                self.signal_change(ctx, true, true);
            }
            DownloadState::Stopped | DownloadState::Paused | DownloadState::Offline => {
                if ctx.manager.has_download(&self.dlid) {
                    let resume = self.resume_command();
                    ctx.manager.queue(self, resume)?;
                }
                self.set_state(ctx, DownloadState::Downloading);
                self.restart(ctx)?;
                self.signal_change(ctx, true, true);
            }
            _ => {}
        }
        Ok(())
    }

    /// Hand the download back to the daemon
    ///
    /// A download the daemon never worked on is started from scratch. Otherwise
    /// the daemon rebuilds it from the stored status blob; before the daemon is
    /// ready the RESTORE waits in the startup table.
    pub fn restart(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        if self.status.is_empty() || self.status.dler_type.is_none() {
            if self.content_type == ContentType::Pending {
                return self.get_content_type(ctx);
            }
            return self.run_downloader(ctx);
        }

        ctx.manager.add_download(self.dlid.clone(), self.id);
        if self.state != DownloadState::Uploading {
            self.set_state(ctx, DownloadState::Downloading);
        }
        let mut downloader = self.status.clone();
        if self.content_type.as_option() == Some(MAGNET_CONTENT_TYPE) {
            downloader.url = Some(self.url.clone());
        }
        let restore = Command::Restore(RestoreArgs {
            downloader,
            metainfo: self.metainfo.clone(),
        });
        ctx.manager.queue(self, restore)
    }

    /// Register with the daemon and ask it to start fetching
    pub(crate) fn run_downloader(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        ctx.manager.add_download(self.dlid.clone(), self.id);
        let resume = self.resume_command();
        ctx.manager.queue(self, resume)?;
        self.set_state(ctx, DownloadState::Downloading);
        self.signal_change(ctx, true, true);
        Ok(())
    }

    fn resume_command(&self) -> Command {
        Command::Resume(ResumeArgs {
            url: self.url.clone(),
            content_type: self.content_type.as_option().map(str::to_string),
            channel_name: self.channel_name.clone(),
        })
    }

    /// Learn the content type, then start the download
    ///
    /// Magnet links need no probe. Anything else has its headers fetched on the
    /// thread pool; whatever the outcome the download is started, with an
    /// unknown type if the probe failed. A result that arrives after the
    /// identifier changed (a retry) is dropped.
    pub(crate) fn get_content_type(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        if is_magnet_uri(&self.url) {
            self.content_type = ContentType::Known(MAGNET_CONTENT_TYPE.to_string());
            return self.run_downloader(ctx);
        }

        let id = self.id;
        let dlid = self.dlid.clone();
        let failed_dlid = dlid.clone();
        let url = self.url.clone();
        let probe = Arc::clone(ctx.probe);

        let queued = ctx.handle.call_in_thread(
            "Grab headers",
            move || probe.probe(&url),
            move |backend: &mut Backend, _, info: HeaderInfo| {
                backend.with_downloader(id, |downloader, ctx| {
                    if downloader.dlid != dlid {
                        return Ok(());
                    }
                    downloader.on_content_type(ctx, info)
                })?;
                Ok(())
            },
            move |backend: &mut Backend, _, error| {
                backend.with_downloader(id, |downloader, ctx| {
                    if downloader.dlid != failed_dlid {
                        return Ok(());
                    }
                    tracing::debug!(dlid = %downloader.dlid, url = %downloader.url, error = %error, "header probe failed");
                    downloader.on_content_type_failed(ctx)
                })?;
                Ok(())
            },
        );
        if let Err(e) = queued {
            tracing::warn!(dlid = %self.dlid, error = %e, "could not probe headers");
            return self.on_content_type_failed(ctx);
        }
        Ok(())
    }

    fn on_content_type(&mut self, ctx: &mut DownloaderContext<'_>, info: HeaderInfo) -> Result<()> {
        if info.status != 200 {
            tracing::debug!(dlid = %self.dlid, status = info.status, "unexpected status probing headers");
            return self.on_content_type_failed(ctx);
        }
        self.url = info.updated_url;
        self.content_type = match info.content_type {
            Some(mime) => ContentType::Known(mime),
            None => ContentType::Unknown,
        };
        self.run_downloader(ctx)
    }

    fn on_content_type_failed(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        self.content_type = ContentType::Unknown;
        self.run_downloader(ctx)
    }

    /// Start seeding a finished torrent at the user's request
    pub fn start_upload(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        if self.get_type() != DownloadType::Bittorrent {
            tracing::warn!(dlid = %self.dlid, "tried to upload a non-torrent download");
            return Ok(());
        }
        if self.child_deleted {
            ctx.emit(Event::SeedingUnavailable { id: self.id });
            return Ok(());
        }
        if !matches!(self.state, DownloadState::Finished | DownloadState::UploadingPaused) {
            tracing::warn!(dlid = %self.dlid, state = %self.state, "start_upload in wrong state");
            return Ok(());
        }

        self.manual_upload = true;
        if ctx.manager.has_download(&self.dlid) {
            let resume = self.resume_command();
            ctx.manager.queue(self, resume)?;
        } else {
            self.set_state(ctx, DownloadState::Uploading);
            self.restart(ctx)?;
        }
        self.signal_change(ctx, true, true);
        Ok(())
    }

    /// Stop seeding
    pub fn stop_upload(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        if ctx.manager.has_download(&self.dlid) {
            ctx.manager.queue(
                self,
                Command::Stop(StopArgs {
                    upload: true,
                    delete: false,
                }),
            )?;
            ctx.manager.delete_download(&self.dlid);
        }
        self.set_state(ctx, DownloadState::Finished);
        self.signal_change(ctx, true, true);
        Ok(())
    }

    /// Pause seeding
    pub fn pause_upload(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        if ctx.manager.has_download(&self.dlid) {
            ctx.manager.queue(self, Command::Pause(PauseArgs { upload: true }))?;
            ctx.manager.delete_download(&self.dlid);
        }
        self.set_state(ctx, DownloadState::UploadingPaused);
        self.signal_change(ctx, true, true);
        Ok(())
    }

    /// Resume a persisted transfer after the coordinator started
    ///
    /// Downloads are restarted. Automatic seeding only resumes while the ratio
    /// limit is not reached; manual seeding always resumes.
    pub fn restart_on_startup_if_needed(&mut self, ctx: &mut DownloaderContext<'_>) -> Result<()> {
        if !ctx.store.exists(self.id) || ctx.manager.has_download(&self.dlid) {
            return Ok(());
        }
        match self.state {
            DownloadState::Downloading | DownloadState::Offline => self.restart(ctx),
            DownloadState::Uploading => {
                let under_limit = ctx.settings.limit_upload_ratio
                    && self.upload_ratio() < ctx.settings.upload_ratio;
                if self.manual_upload || under_limit {
                    self.restart(ctx)
                } else {
                    self.stop_upload(ctx)
                }
            }
            _ => Ok(()),
        }
    }
}
