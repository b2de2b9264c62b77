//! Consumer entities interested in a download.
//!
//! A consumer is typically a playable item in a feed. Several items can share
//! one download; the [`RemoteDownloader`] owns its consumers and tells them when
//! the download finishes, moves, or changes.

use std::path::Path;

use crate::downloader::RemoteDownloader;
use crate::types::{DownloaderId, ItemId};

/// Something that wants the file a [`RemoteDownloader`] fetches
pub trait DownloadConsumer: Send {
    /// Stable identifier of this consumer
    fn id(&self) -> ItemId;

    /// URL the consumer wants downloaded
    fn url(&self) -> String;

    /// MIME type announced for the URL (e.g. by a feed enclosure)
    fn enclosure_type(&self) -> Option<String> {
        None
    }

    /// Title of the channel the consumer belongs to
    fn channel_name(&self) -> Option<String> {
        None
    }

    /// Downloader this consumer was attached to before, if any
    fn downloader_id(&self) -> Option<DownloaderId> {
        None
    }

    /// The download entered a finished state
    fn on_download_finished(&mut self, downloader: &RemoteDownloader);

    /// The finished file moved from `old_filename` to `new_filename`
    fn on_downloader_migrated(&mut self, old_filename: &Path, new_filename: &Path);

    /// Move files owned by the consumer itself into `directory`
    fn migrate_children(&mut self, _directory: &Path) {}

    /// Visible fields of the download changed
    fn on_downloader_changed(&mut self, _downloader: &RemoteDownloader) {}
}
