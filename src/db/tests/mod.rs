mod migrations;

use crate::status::DownloadStatus;
use crate::store::DownloaderRecord;
use crate::types::{ContentType, Dlid, DownloadState, DownloaderId};

fn record(id: i64, dlid: &str, url: &str) -> DownloaderRecord {
    DownloaderRecord {
        id: DownloaderId(id),
        dlid: Dlid::from(dlid),
        orig_url: url.to_string(),
        url: url.to_string(),
        content_type: ContentType::Pending,
        channel_name: None,
        state: DownloadState::Downloading,
        status: DownloadStatus::default(),
        metainfo: None,
        manual_upload: false,
        main_item_id: None,
        child_deleted: false,
    }
}
