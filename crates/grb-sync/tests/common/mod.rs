#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use grb_adapters::{
    AdapterError, ArtifactSource, HistoryRecord, HistorySource, IndexerCache, IndexerInfo,
    SearchIndex,
};
use grb_core::{Candidate, Clock, ManualClock};
use grb_storage::{info_hash, ArtifactError, ArtifactLimits, ArtifactStore, FetchError, StoredArtifact};
use grb_sync::{GrabStore, Ingestor};
use serde::Serialize;
use tempfile::TempDir;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[derive(Serialize)]
struct TorrentFile<'a> {
    announce: &'a str,
    info: TorrentInfo<'a>,
}

#[derive(Serialize)]
struct TorrentInfo<'a> {
    length: i64,
    name: &'a str,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: &'a str,
}

/// Minimal single-file torrent; `name` changes the info hash.
pub fn torrent(name: &str) -> (Vec<u8>, String) {
    let bytes = serde_bencode::to_bytes(&TorrentFile {
        announce: "http://tracker.test/announce",
        info: TorrentInfo {
            length: 1_500_000_000,
            name,
            piece_length: 262_144,
            pieces: "77777777777777777777",
        },
    })
    .unwrap();
    let hash = info_hash(&bytes).unwrap();
    (bytes, hash)
}

pub fn candidate(title: &str, indexer: &str, hash: Option<&str>, url: &str) -> Candidate {
    Candidate {
        title: Some(title.to_string()),
        indexer: Some(indexer.to_string()),
        indexer_id: Some(7),
        info_hash: hash.map(str::to_string),
        download_url: Some(url.to_string()),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeSearchIndex {
    pub candidates: Mutex<Vec<Candidate>>,
    pub indexers: Vec<IndexerInfo>,
    pub searches: AtomicUsize,
    pub fail: bool,
}

impl FakeSearchIndex {
    pub fn with(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            indexers: vec![IndexerInfo {
                id: 7,
                name: "ExampleTracker".to_string(),
            }],
            ..Default::default()
        }
    }

    pub fn set(&self, candidates: Vec<Candidate>) {
        *self.candidates.lock().unwrap() = candidates;
    }
}

#[async_trait]
impl SearchIndex for FakeSearchIndex {
    async fn search(&self, _title: &str) -> Result<Vec<Candidate>, AdapterError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AdapterError::Message("search index offline".into()));
        }
        Ok(self.candidates.lock().unwrap().clone())
    }

    async fn list_indexers(&self) -> Result<Vec<IndexerInfo>, AdapterError> {
        Ok(self.indexers.clone())
    }

    fn indexer_download_handle(&self, indexer_id: i64, locator: &str, file_name: &str) -> String {
        format!("fake://indexer/{indexer_id}/download?link={locator}&file={file_name}")
    }
}

/// Serves fixed bytes per download handle into a temp artifact store.
pub struct FakeArtifactSource {
    store: ArtifactStore,
    pub payloads: Mutex<HashMap<String, Vec<u8>>>,
    pub fetches: AtomicUsize,
}

impl FakeArtifactSource {
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            store: ArtifactStore::new(root),
            payloads: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.payloads.lock().unwrap().insert(url.to_string(), bytes);
    }
}

#[async_trait]
impl ArtifactSource for FakeArtifactSource {
    fn store(&self) -> &ArtifactStore {
        &self.store
    }

    async fn fetch(&self, download_url: &str, file_name: &str) -> Result<StoredArtifact, ArtifactError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let bytes = self.payloads.lock().unwrap().get(download_url).cloned();
        match bytes {
            Some(bytes) => {
                self.store
                    .store_bytes(file_name, &bytes, ArtifactLimits::default())
                    .await
            }
            None => Err(ArtifactError::Fetch(FetchError::HttpStatus {
                status: 404,
                url: download_url.to_string(),
            })),
        }
    }
}

/// Newest-first pages; optionally fails from `fail_from_page` on.
pub struct FakeHistorySource {
    pub instance: String,
    pub pages: Vec<Vec<HistoryRecord>>,
    pub fail_from_page: Option<u32>,
    pub requested: Mutex<Vec<u32>>,
}

impl FakeHistorySource {
    pub fn new(instance: &str, pages: Vec<Vec<HistoryRecord>>) -> Self {
        Self {
            instance: instance.to_string(),
            pages,
            fail_from_page: None,
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistorySource for FakeHistorySource {
    fn instance(&self) -> &str {
        &self.instance
    }

    async fn history_page(&self, page: u32, _page_size: u32) -> Result<Vec<HistoryRecord>, AdapterError> {
        self.requested.lock().unwrap().push(page);
        if self.fail_from_page.is_some_and(|fail| page >= fail) {
            return Err(AdapterError::Message(format!("page {page} unavailable")));
        }
        Ok(self
            .pages
            .get(page as usize - 1)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn grabbed(id: i64, download_id: &str, title: &str, at: DateTime<Utc>) -> HistoryRecord {
    HistoryRecord {
        id: Some(id),
        event_type: Some("grabbed".to_string()),
        download_id: Some(download_id.to_string()),
        source_title: Some(title.to_string()),
        indexer: Some("ExampleTracker".to_string()),
        size: Some(1_500_000_000),
        info_url: Some(format!("https://x/{id}")),
        date: Some(at),
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: GrabStore,
    pub search: Arc<FakeSearchIndex>,
    pub artifacts: Arc<FakeArtifactSource>,
    pub ingestor: Arc<Ingestor>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(search: FakeSearchIndex) -> Self {
        let clock = Arc::new(ManualClock::new(base_time()));
        let store = GrabStore::in_memory(clock.clone() as Arc<dyn Clock>)
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let search = Arc::new(search);
        let artifacts = Arc::new(FakeArtifactSource::new(&dir.path().join("torrents")));
        let indexers = Arc::new(IndexerCache::new(
            Duration::from_secs(3600),
            clock.clone() as Arc<dyn Clock>,
        ));
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            Some(search.clone() as Arc<dyn SearchIndex>),
            artifacts.clone() as Arc<dyn ArtifactSource>,
            indexers,
        ));
        Self {
            clock,
            store,
            search,
            artifacts,
            ingestor,
            dir,
        }
    }

    pub fn artifact_path(&self, file_name: &str) -> std::path::PathBuf {
        self.dir.path().join("torrents").join(file_name)
    }
}
