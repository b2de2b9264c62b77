//! Shared fixtures for unit tests of the downloader and backend.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::{broadcast, watch};

use crate::backend::Backend;
use crate::config::{CoordinatorConfig, EventLoopConfig, Settings};
use crate::consumer::DownloadConsumer;
use crate::daemon::{ChannelDaemon, ChannelTransport, DaemonCommand};
use crate::downloader::RemoteDownloader;
use crate::error::{Error, Result};
use crate::eventloop::EventLoop;
use crate::probe::{HeaderInfo, HeaderProbe};
use crate::status::DownloadStatus;
use crate::store::{DownloaderRecord, DownloaderStore, MemoryStore};
use crate::types::{
    BITTORRENT_CONTENT_TYPE, ContentType, Dlid, DownloadState, DownloaderId, Event, ItemId,
};

/// Store whose contents the test can inspect while the backend owns it
#[derive(Clone, Default)]
pub(crate) struct SharedStore(pub(crate) Arc<Mutex<MemoryStore>>);

impl SharedStore {
    pub(crate) fn get(&self, id: DownloaderId) -> Option<DownloaderRecord> {
        self.0.lock().unwrap().get(id).cloned()
    }
}

impl DownloaderStore for SharedStore {
    fn allocate_id(&mut self) -> DownloaderId {
        self.0.lock().unwrap().allocate_id()
    }

    fn exists(&self, id: DownloaderId) -> bool {
        self.0.lock().unwrap().exists(id)
    }

    fn find_by_dlid(&self, dlid: &Dlid) -> Option<DownloaderId> {
        self.0.lock().unwrap().find_by_dlid(dlid)
    }

    fn find_by_url(&self, orig_url: &str) -> Option<DownloaderId> {
        self.0.lock().unwrap().find_by_url(orig_url)
    }

    fn save(&mut self, record: &DownloaderRecord) -> Result<()> {
        self.0.lock().unwrap().save(record)
    }

    fn delete(&mut self, id: DownloaderId) -> Result<()> {
        self.0.lock().unwrap().delete(id)
    }

    fn load_all(&self) -> Vec<DownloaderRecord> {
        self.0.lock().unwrap().load_all()
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Probe answering every URL with a canned result
pub(crate) struct StaticProbe {
    pub(crate) status: u16,
    pub(crate) updated_url: Option<String>,
    pub(crate) content_type: Option<String>,
}

impl StaticProbe {
    pub(crate) fn ok(content_type: &str) -> Self {
        Self {
            status: 200,
            updated_url: None,
            content_type: Some(content_type.to_string()),
        }
    }
}

impl HeaderProbe for StaticProbe {
    fn probe(&self, url: &str) -> Result<HeaderInfo> {
        if self.status == 0 {
            return Err(Error::Other("connection refused".into()));
        }
        Ok(HeaderInfo {
            status: self.status,
            updated_url: self.updated_url.clone().unwrap_or_else(|| url.to_string()),
            content_type: self.content_type.clone(),
        })
    }
}

/// Consumer that records every callback
pub(crate) struct TestItem {
    pub(crate) id: ItemId,
    pub(crate) url: String,
    pub(crate) enclosure_type: Option<String>,
    pub(crate) downloader_id: Option<DownloaderId>,
    pub(crate) log: Arc<Mutex<Vec<String>>>,
}

impl TestItem {
    pub(crate) fn new(id: i64, url: &str) -> (Box<dyn DownloadConsumer>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let item = TestItem {
            id: ItemId(id),
            url: url.to_string(),
            enclosure_type: None,
            downloader_id: None,
            log: Arc::clone(&log),
        };
        (Box::new(item), log)
    }
}

impl DownloadConsumer for TestItem {
    fn id(&self) -> ItemId {
        self.id
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn enclosure_type(&self) -> Option<String> {
        self.enclosure_type.clone()
    }

    fn channel_name(&self) -> Option<String> {
        Some("Test Channel".to_string())
    }

    fn downloader_id(&self) -> Option<DownloaderId> {
        self.downloader_id
    }

    fn on_download_finished(&mut self, _downloader: &RemoteDownloader) {
        self.log.lock().unwrap().push("finished".to_string());
    }

    fn on_downloader_migrated(&mut self, old_filename: &Path, new_filename: &Path) {
        self.log.lock().unwrap().push(format!(
            "migrated {} -> {}",
            old_filename.display(),
            new_filename.display()
        ));
    }

    fn migrate_children(&mut self, _directory: &Path) {
        self.log.lock().unwrap().push("children".to_string());
    }
}

/// A stored torrent download in `state` that the daemon already worked on
pub(crate) fn record(id: i64, state: DownloadState) -> DownloaderRecord {
    let url = format!("http://example.com/{id}.torrent");
    DownloaderRecord {
        id: DownloaderId(id),
        dlid: Dlid::from(format!("download{id:08}")),
        orig_url: url.clone(),
        url,
        content_type: ContentType::Known(BITTORRENT_CONTENT_TYPE.to_string()),
        channel_name: None,
        state,
        status: DownloadStatus {
            state: Some(state),
            dler_type: Some("BitTorrent".to_string()),
            ..Default::default()
        },
        metainfo: None,
        manual_upload: false,
        main_item_id: None,
        child_deleted: false,
    }
}

/// A backend on a real event loop, talking to an in-process daemon
pub(crate) struct Harness {
    pub(crate) event_loop: EventLoop<Backend>,
    pub(crate) backend: Backend,
    pub(crate) daemon: ChannelDaemon,
    pub(crate) store: SharedStore,
    pub(crate) settings: watch::Sender<Settings>,
    pub(crate) events: broadcast::Receiver<Event>,
    pub(crate) dir: TempDir,
}

impl Harness {
    pub(crate) fn new(records: Vec<DownloaderRecord>) -> Self {
        Self::with_probe(records, StaticProbe::ok("video/mp4"))
    }

    pub(crate) fn with_probe(records: Vec<DownloaderRecord>, probe: StaticProbe) -> Self {
        let config = CoordinatorConfig {
            min_status_update_spacing: Duration::ZERO,
            ..Default::default()
        };
        Self::build(records, probe, config)
    }

    pub(crate) fn build(
        records: Vec<DownloaderRecord>,
        probe: StaticProbe,
        config: CoordinatorConfig,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            movies_directory: dir.path().join("Movies"),
            ..Default::default()
        };
        let (settings_tx, settings_rx) = watch::channel(settings);

        let event_loop: EventLoop<Backend> = EventLoop::new(&EventLoopConfig::default()).unwrap();
        let (transport, daemon) = ChannelTransport::pair();
        let store = SharedStore(Arc::new(Mutex::new(MemoryStore::with_records(records))));
        let backend = Backend::new(
            event_loop.handle(),
            Box::new(transport),
            Box::new(store.clone()),
            Arc::new(probe),
            config,
            settings_rx,
        );
        let events = backend.subscribe();
        Self {
            event_loop,
            backend,
            daemon,
            store,
            settings: settings_tx,
            events,
            dir,
        }
    }

    /// Run loop iterations until `done` holds or a second passes
    pub(crate) fn run_until(&mut self, done: impl Fn(&Backend) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if done(&self.backend) {
                return true;
            }
            self.event_loop
                .run_once(&mut self.backend, Some(Duration::from_millis(5)))
                .unwrap();
        }
        done(&self.backend)
    }

    /// Run loop iterations for `duration`
    pub(crate) fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.event_loop
                .run_once(&mut self.backend, Some(Duration::from_millis(5)))
                .unwrap();
        }
    }

    /// Start the daemon and deliver its ready message
    pub(crate) fn start_daemon(&mut self) {
        self.backend.startup_downloader().unwrap();
        self.daemon.send(crate::daemon::DaemonMessage::Ready);
        assert!(self.run_until(|backend| backend.manager().daemon_started()));
    }

    /// Every command batch the daemon received so far, flattened
    pub(crate) fn sent_commands(&mut self) -> Vec<DaemonCommand> {
        self.daemon.drain()
    }

    pub(crate) fn drain_events(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    pub(crate) fn downloader(&self, id: DownloaderId) -> &RemoteDownloader {
        self.backend.downloader(id).unwrap()
    }
}
