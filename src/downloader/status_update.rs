//! Reconciliation of status pushes from the worker daemon.

use std::time::Instant;

use super::{DownloaderContext, RemoteDownloader};
use crate::error::Result;
use crate::status::StatusReport;
use crate::types::{DownloadState, Event};

/// What happened to a status report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusDisposition {
    /// No downloader uses the report's identifier
    Untracked,
    /// A command is pending and the report is not its reply
    Frozen,
    /// The reply belongs to a command that was superseded locally
    Stale,
    /// Accepted, but nothing changed
    Unchanged,
    /// Accepted and applied
    Applied {
        /// Arrived too soon after the previous accepted report
        rate_limited: bool,
        /// The download just entered a finished state
        finished: bool,
        /// The finished file moved
        file_migrated: bool,
    },
}

impl RemoteDownloader {
    /// Apply a status report from the daemon
    ///
    /// `cmd_done` marks a direct reply to a command. Unsolicited pushes are
    /// dropped while a command is pending, and a reply that contradicts a state
    /// we set locally afterwards is dropped too, unless it is the natural
    /// `downloading` to `finished` transition. Reports arriving faster than the
    /// configured spacing are applied without notifying consumers.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Backend parts the update may touch
    /// * `report` - Status keys that changed, plus optional metainfo
    /// * `cmd_done` - Whether the report answers a command
    /// * `now` - Arrival time, compared against the previous accepted report
    pub fn update_status(
        &mut self,
        ctx: &mut DownloaderContext<'_>,
        report: StatusReport,
        cmd_done: bool,
        now: Instant,
    ) -> Result<StatusDisposition> {
        if self.status_updates_frozen && !cmd_done {
            tracing::debug!(dlid = %self.dlid, "status update while a command is pending, ignoring");
            return Ok(StatusDisposition::Frozen);
        }

        let rate_limited = match now.checked_duration_since(self.last_update) {
            Some(elapsed) => elapsed < ctx.config.min_status_update_spacing,
            None => {
                tracing::debug!(dlid = %self.dlid, "status update older than the previous one");
                false
            }
        };

        // A reply without a state leaves the state as it is
        let new_state = report.status.state.unwrap_or(self.state);
        if cmd_done
            && self.state.is_comparable()
            && new_state.is_comparable()
            && self.state != new_state
            && !(self.state == DownloadState::Downloading && new_state == DownloadState::Finished)
        {
            tracing::debug!(
                dlid = %self.dlid,
                current = %self.state,
                reported = %new_state,
                "stale command reply, ignoring"
            );
            return Ok(StatusDisposition::Stale);
        }

        self.status_updates_frozen = false;

        let metainfo = report.metainfo.or_else(|| self.metainfo.clone());
        let status = self.status.merged(report.status);
        if status == self.status && metainfo == self.metainfo {
            return Ok(StatusDisposition::Unchanged);
        }

        self.last_update = now;
        let was_finished = self.is_finished();
        let old_filename = self.status.filename.clone();
        let old_state = self.state;
        let metainfo_changed = metainfo != self.metainfo;

        self.change_status(ctx, |current| *current = status);
        self.metainfo = metainfo;

        let finished = self.is_finished() && !was_finished;
        let file_migrated = self.is_finished() && self.status.filename != old_filename;
        let needs_signal_item = !(finished || file_migrated || rate_limited);

        if self.state == DownloadState::Uploading
            && !self.manual_upload
            && ctx.settings.limit_upload_ratio
            && self.upload_ratio() > ctx.settings.upload_ratio
        {
            tracing::info!(dlid = %self.dlid, ratio = self.upload_ratio(), "upload ratio reached");
            self.stop_upload(ctx)?;
        }

        if !metainfo_changed && self.state == old_state {
            let delay = ctx.config.save_delay;
            self.save_later_after_delay(ctx, delay);
            self.signal_change(ctx, false, needs_signal_item);
        } else {
            self.signal_change(ctx, true, needs_signal_item);
        }

        if finished {
            tracing::info!(dlid = %self.dlid, url = %self.url, "download finished");
            ctx.emit(Event::DownloadFinished {
                id: self.id,
                dlid: self.dlid.clone(),
            });
            self.notify_items(|item, downloader| item.on_download_finished(downloader));
        } else if file_migrated {
            if let (Some(old), Some(new)) = (old_filename, self.status.filename.clone()) {
                self.file_migrated(ctx, &old, &new);
            }
        }

        Ok(StatusDisposition::Applied {
            rate_limited,
            finished,
            file_migrated,
        })
    }
}
