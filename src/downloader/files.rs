//! Deleting and moving downloaded data.

use std::io;
use std::path::Path;

use super::{DownloaderContext, RemoteDownloader};
use crate::daemon::DaemonCommand;
use crate::error::Result;
use crate::types::Event;
use crate::utils::{
    filter_directory_name, move_path, next_free_directory, next_free_filename, remove_path,
};

impl RemoteDownloader {
    /// Move the download into `directory`
    ///
    /// While the daemon owns the transfer it does the move itself and reports
    /// the new filename. Otherwise a finished file is moved here, into a
    /// per-channel subdirectory, under a free name. Every consumer then gets to
    /// move its own files.
    pub fn migrate(&mut self, ctx: &mut DownloaderContext<'_>, directory: &Path) -> Result<()> {
        if ctx.manager.has_download(&self.dlid) {
            ctx.manager.send_command(DaemonCommand::Migrate {
                dlid: self.dlid.clone(),
                directory: directory.to_path_buf(),
            })?;
        } else if !self.migrate_locally(ctx, directory) {
            return Ok(());
        }

        let mut items = std::mem::take(&mut self.items);
        for item in items.iter_mut() {
            item.migrate_children(directory);
        }
        self.items = items;
        Ok(())
    }

    /// Returns `false` when there is nothing to migrate or the file is already in place
    fn migrate_locally(&mut self, ctx: &mut DownloaderContext<'_>, directory: &Path) -> bool {
        let (Some(short_filename), Some(filename)) =
            (self.status.short_filename.clone(), self.status.filename.clone())
        else {
            tracing::warn!(dlid = %self.dlid, url = %self.url, "can't migrate download without a filename");
            return false;
        };
        if !filename.exists() {
            return true;
        }

        let mut target_dir = directory.to_path_buf();
        if let Some(channel) = &self.status.channel_name {
            let channel = filter_directory_name(channel);
            if !channel.is_empty() {
                target_dir.push(channel);
            }
        }
        if let Err(e) = std::fs::create_dir_all(&target_dir) {
            tracing::warn!(dir = %target_dir.display(), error = %e, "could not create migration directory");
            return true;
        }

        let wanted = target_dir.join(short_filename);
        if wanted == filename {
            return false;
        }

        let reserved = if filename.is_dir() {
            next_free_directory(&wanted)
        } else {
            next_free_filename(&wanted)
        };
        let destination = match reserved {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(dlid = %self.dlid, error = %e, "no free name to migrate to");
                return true;
            }
        };

        match move_path(&filename, &destination) {
            Ok(()) => {
                tracing::info!(
                    dlid = %self.dlid,
                    from = %filename.display(),
                    to = %destination.display(),
                    "migrated download"
                );
                let new_filename = destination.clone();
                self.change_status(ctx, |status| status.filename = Some(new_filename));
                self.signal_change(ctx, true, false);
                self.file_migrated(ctx, &filename, &destination);
            }
            Err(e) => {
                tracing::warn!(
                    dlid = %self.dlid,
                    from = %filename.display(),
                    to = %destination.display(),
                    error = %e,
                    "error migrating download"
                );
                if destination.is_file() {
                    std::fs::remove_file(&destination).ok();
                }
            }
        }
        true
    }

    pub(crate) fn file_migrated(
        &mut self,
        ctx: &mut DownloaderContext<'_>,
        old_filename: &Path,
        new_filename: &Path,
    ) {
        ctx.emit(Event::FileMigrated {
            id: self.id,
            old_filename: old_filename.to_path_buf(),
            new_filename: new_filename.to_path_buf(),
        });
        self.notify_items(|item, _| item.on_downloader_migrated(old_filename, new_filename));
    }

    /// Delete the downloaded data and its directory if that is left empty
    ///
    /// The movies directory itself is never removed. Failures are logged.
    pub(crate) fn delete_downloaded_files(&self, ctx: &DownloaderContext<'_>) {
        let Some(filename) = self.status.filename.as_deref() else {
            return;
        };
        match remove_path(filename) {
            Ok(()) => tracing::debug!(path = %filename.display(), "deleted download"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %filename.display(), error = %e, "error deleting downloaded file");
            }
        }

        let Some(parent) = filename.parent() else {
            return;
        };
        if parent == ctx.settings.movies_directory || !parent.exists() {
            return;
        }
        let empty = std::fs::read_dir(parent)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            if let Err(e) = std::fs::remove_dir(parent) {
                tracing::warn!(path = %parent.display(), error = %e, "error deleting empty download directory");
            }
        }
    }
}
