//! Durable storage of remote downloader records.
//!
//! The event loop thread never waits on disk. Every store keeps the full set of
//! records in memory, so lookups (`exists`, by identifier, by URL) are answered
//! synchronously; [`SqliteStore`] additionally hands each write to a tokio task
//! that applies it to the [`Database`] in order.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::db::Database;
use crate::error::{DatabaseError, Error, Result};
use crate::status::DownloadStatus;
use crate::types::{ContentType, Dlid, DownloadState, DownloaderId, ItemId};

/// Persisted fields of a [`RemoteDownloader`](crate::downloader::RemoteDownloader)
#[derive(Clone, Debug, PartialEq)]
pub struct DownloaderRecord {
    /// Persistent id
    pub id: DownloaderId,
    /// Download identifier shared with the daemon
    pub dlid: Dlid,
    /// URL the download was created for
    pub orig_url: String,
    /// Current (possibly redirected) URL
    pub url: String,
    /// Probed content type
    pub content_type: ContentType,
    /// Channel the download belongs to
    pub channel_name: Option<String>,
    /// Visible state
    pub state: DownloadState,
    /// Last accepted status blob
    pub status: DownloadStatus,
    /// BitTorrent metadata
    pub metainfo: Option<Vec<u8>>,
    /// Seeding was started by the user
    pub manual_upload: bool,
    /// Item the download was started for
    pub main_item_id: Option<ItemId>,
    /// Part of the torrent data was deleted
    pub child_deleted: bool,
}

/// Persistence primitives the coordinator needs
pub trait DownloaderStore: Send {
    /// Reserve a fresh id for a new record
    fn allocate_id(&mut self) -> DownloaderId;

    /// Whether a record with this id is stored
    fn exists(&self, id: DownloaderId) -> bool;

    /// Id of the record using `dlid`
    fn find_by_dlid(&self, dlid: &Dlid) -> Option<DownloaderId>;

    /// Id of the oldest record created for `orig_url`
    fn find_by_url(&self, orig_url: &str) -> Option<DownloaderId>;

    /// Insert or replace a record
    fn save(&mut self, record: &DownloaderRecord) -> Result<()>;

    /// Remove a record; removing an unknown id is not an error
    fn delete(&mut self, id: DownloaderId) -> Result<()>;

    /// Every stored record, ordered by id
    fn load_all(&self) -> Vec<DownloaderRecord>;

    /// Wait until every earlier write is durable
    fn flush(&mut self) -> Result<()>;
}

#[derive(Default)]
struct RecordIndex {
    records: BTreeMap<DownloaderId, DownloaderRecord>,
    next_id: i64,
}

impl RecordIndex {
    fn from_records(records: Vec<DownloaderRecord>) -> Self {
        let next_id = records.iter().map(|r| r.id.0).max().unwrap_or(0);
        Self {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
            next_id,
        }
    }

    fn allocate_id(&mut self) -> DownloaderId {
        self.next_id += 1;
        DownloaderId(self.next_id)
    }

    fn find_by_dlid(&self, dlid: &Dlid) -> Option<DownloaderId> {
        self.records.values().find(|r| &r.dlid == dlid).map(|r| r.id)
    }

    fn find_by_url(&self, orig_url: &str) -> Option<DownloaderId> {
        self.records
            .values()
            .find(|r| r.orig_url == orig_url)
            .map(|r| r.id)
    }

    fn save(&mut self, record: &DownloaderRecord) {
        self.next_id = self.next_id.max(record.id.0);
        self.records.insert(record.id, record.clone());
    }
}

/// Keeps records in memory only
#[derive(Default)]
pub struct MemoryStore {
    index: RecordIndex,
}

impl MemoryStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `records`
    pub fn with_records(records: Vec<DownloaderRecord>) -> Self {
        Self {
            index: RecordIndex::from_records(records),
        }
    }

    /// The stored record with this id
    pub fn get(&self, id: DownloaderId) -> Option<&DownloaderRecord> {
        self.index.records.get(&id)
    }
}

impl DownloaderStore for MemoryStore {
    fn allocate_id(&mut self) -> DownloaderId {
        self.index.allocate_id()
    }

    fn exists(&self, id: DownloaderId) -> bool {
        self.index.records.contains_key(&id)
    }

    fn find_by_dlid(&self, dlid: &Dlid) -> Option<DownloaderId> {
        self.index.find_by_dlid(dlid)
    }

    fn find_by_url(&self, orig_url: &str) -> Option<DownloaderId> {
        self.index.find_by_url(orig_url)
    }

    fn save(&mut self, record: &DownloaderRecord) -> Result<()> {
        self.index.save(record);
        Ok(())
    }

    fn delete(&mut self, id: DownloaderId) -> Result<()> {
        self.index.records.remove(&id);
        Ok(())
    }

    fn load_all(&self) -> Vec<DownloaderRecord> {
        self.index.records.values().cloned().collect()
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

enum WriteOp {
    Save(Box<DownloaderRecord>),
    Delete(DownloaderId),
    Flush(oneshot::Sender<()>),
}

/// SQLite-backed store with write-behind
///
/// Writes are applied by a task on the given tokio runtime, in the order they
/// were made. Failed writes are logged. Dropping the store lets the task finish
/// the queued writes and close the database.
pub struct SqliteStore {
    index: RecordIndex,
    writer: mpsc::UnboundedSender<WriteOp>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and load every record
    ///
    /// Blocks the calling thread; must not be called from inside the runtime.
    pub fn open(path: &Path, runtime: Handle) -> Result<Self> {
        let (db, records) = runtime.block_on(async {
            let db = Database::new(path).await?;
            let records = db.list_downloaders().await?;
            Ok::<_, Error>((db, records))
        })?;

        tracing::info!(path = %path.display(), count = records.len(), "loaded downloader records");

        let (writer, ops) = mpsc::unbounded_channel();
        runtime.spawn(write_behind(db, ops));

        Ok(Self {
            index: RecordIndex::from_records(records),
            writer,
        })
    }

    fn submit(&self, op: WriteOp) -> Result<()> {
        self.writer
            .send(op)
            .map_err(|_| Error::Database(DatabaseError::WriterClosed))
    }
}

impl DownloaderStore for SqliteStore {
    fn allocate_id(&mut self) -> DownloaderId {
        self.index.allocate_id()
    }

    fn exists(&self, id: DownloaderId) -> bool {
        self.index.records.contains_key(&id)
    }

    fn find_by_dlid(&self, dlid: &Dlid) -> Option<DownloaderId> {
        self.index.find_by_dlid(dlid)
    }

    fn find_by_url(&self, orig_url: &str) -> Option<DownloaderId> {
        self.index.find_by_url(orig_url)
    }

    fn save(&mut self, record: &DownloaderRecord) -> Result<()> {
        self.index.save(record);
        self.submit(WriteOp::Save(Box::new(record.clone())))
    }

    fn delete(&mut self, id: DownloaderId) -> Result<()> {
        self.index.records.remove(&id);
        self.submit(WriteOp::Delete(id))
    }

    fn load_all(&self) -> Vec<DownloaderRecord> {
        self.index.records.values().cloned().collect()
    }

    fn flush(&mut self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.submit(WriteOp::Flush(done))?;
        wait.blocking_recv()
            .map_err(|_| Error::Database(DatabaseError::WriterClosed))
    }
}

async fn write_behind(db: Database, mut ops: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Save(record) => {
                if let Err(e) = db.upsert_downloader(&record).await {
                    tracing::error!(id = %record.id, dlid = %record.dlid, error = %e, "failed to save downloader");
                }
            }
            WriteOp::Delete(id) => {
                if let Err(e) = db.delete_downloader(id).await {
                    tracing::error!(id = %id, error = %e, "failed to delete downloader");
                }
            }
            WriteOp::Flush(done) => {
                done.send(()).ok();
            }
        }
    }
    db.close().await;
}
