//! Remote downloader CRUD operations.

use crate::error::DatabaseError;
use crate::status::DownloadStatus;
use crate::store::DownloaderRecord;
use crate::types::{ContentType, Dlid, DownloaderId, ItemId};
use crate::{Error, Result};

use super::{Database, DownloaderRow};

const SELECT_COLUMNS: &str = r#"
    SELECT
        id, dlid, orig_url, url, content_type, channel_name, state, status,
        metainfo, manual_upload, main_item_id, child_deleted, updated_at
    FROM remote_downloaders
"#;

impl Database {
    /// Insert a downloader record, or replace the one with the same id
    pub async fn upsert_downloader(&self, record: &DownloaderRecord) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let status = serde_json::to_string(&record.status)?;

        sqlx::query(
            r#"
            INSERT INTO remote_downloaders (
                id, dlid, orig_url, url, content_type, channel_name, state, status,
                metainfo, manual_upload, main_item_id, child_deleted, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                dlid = excluded.dlid,
                orig_url = excluded.orig_url,
                url = excluded.url,
                content_type = excluded.content_type,
                channel_name = excluded.channel_name,
                state = excluded.state,
                status = excluded.status,
                metainfo = excluded.metainfo,
                manual_upload = excluded.manual_upload,
                main_item_id = excluded.main_item_id,
                child_deleted = excluded.child_deleted,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.id)
        .bind(record.dlid.as_str())
        .bind(&record.orig_url)
        .bind(&record.url)
        .bind(record.content_type.to_column())
        .bind(&record.channel_name)
        .bind(record.state.as_str())
        .bind(status)
        .bind(&record.metainfo)
        .bind(record.manual_upload)
        .bind(record.main_item_id.map(|item| item.0))
        .bind(record.child_deleted)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to save downloader: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Delete a downloader record; returns whether it existed
    pub async fn delete_downloader(&self, id: DownloaderId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM remote_downloaders WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete downloader: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a downloader by id
    pub async fn get_downloader(&self, id: DownloaderId) -> Result<Option<DownloaderRecord>> {
        let row = sqlx::query_as::<_, DownloaderRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get downloader: {}",
                    e
                )))
            })?;

        row.map(DownloaderRecord::try_from).transpose()
    }

    /// Get the downloader currently using `dlid`
    pub async fn get_downloader_by_dlid(&self, dlid: &Dlid) -> Result<Option<DownloaderRecord>> {
        let row =
            sqlx::query_as::<_, DownloaderRow>(&format!("{SELECT_COLUMNS} WHERE dlid = ?"))
                .bind(dlid.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to get downloader by dlid: {}",
                        e
                    )))
                })?;

        row.map(DownloaderRecord::try_from).transpose()
    }

    /// Get the oldest downloader created for `orig_url`
    pub async fn get_downloader_by_url(&self, orig_url: &str) -> Result<Option<DownloaderRecord>> {
        let row = sqlx::query_as::<_, DownloaderRow>(&format!(
            "{SELECT_COLUMNS} WHERE orig_url = ? ORDER BY id LIMIT 1"
        ))
        .bind(orig_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get downloader by url: {}",
                e
            )))
        })?;

        row.map(DownloaderRecord::try_from).transpose()
    }

    /// List every downloader, oldest first
    pub async fn list_downloaders(&self) -> Result<Vec<DownloaderRecord>> {
        let rows = sqlx::query_as::<_, DownloaderRow>(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list downloaders: {}",
                    e
                )))
            })?;

        rows.into_iter().map(DownloaderRecord::try_from).collect()
    }

    /// Highest id in use, 0 when the table is empty
    pub async fn max_downloader_id(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM remote_downloaders")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to query max downloader id: {}",
                    e
                )))
            })?;

        Ok(max.unwrap_or(0))
    }
}

impl TryFrom<DownloaderRow> for DownloaderRecord {
    type Error = Error;

    fn try_from(row: DownloaderRow) -> Result<Self> {
        let state = row.state.parse().map_err(|e: String| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Invalid state for downloader {}: {}",
                row.id, e
            )))
        })?;
        let status: DownloadStatus = serde_json::from_str(&row.status)?;

        Ok(DownloaderRecord {
            id: DownloaderId(row.id),
            dlid: Dlid::from(row.dlid),
            orig_url: row.orig_url,
            url: row.url,
            content_type: ContentType::from_column(row.content_type),
            channel_name: row.channel_name,
            state,
            status,
            metainfo: row.metainfo,
            manual_upload: row.manual_upload,
            main_item_id: row.main_item_id.map(ItemId),
            child_deleted: row.child_deleted,
        })
    }
}
