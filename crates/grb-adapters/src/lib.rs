//! Clients for the systems GRB reconciles: the release search index, the
//! download managers' history logs, artifact downloads and inbound webhooks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use grb_core::{
    normalize_indexer, normalize_instance, parse_timestamp, Candidate, Clock, NewHistoryEntry,
};
use grb_storage::{
    ArtifactError, ArtifactLimits, ArtifactStore, FetchError, HttpFetcher, HttpRequest,
    StoredArtifact,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "grb-adapters";

const SEARCH_INDEX_SOURCE: &str = "prowlarr";
const API_KEY_HEADER: &str = "X-Api-Key";

/// Keys under which history APIs nest their record arrays.
const RECORD_CONTAINER_KEYS: [&str; 4] = ["records", "data", "results", "items"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_transient(),
            Self::Artifact(ArtifactError::Fetch(err)) => err.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerInfo {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

/// Third-party release search index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn search(&self, title: &str) -> Result<Vec<Candidate>, AdapterError>;

    async fn list_indexers(&self) -> Result<Vec<IndexerInfo>, AdapterError>;

    /// Download handle that fetches `locator` through a specific indexer.
    fn indexer_download_handle(&self, indexer_id: i64, locator: &str, file_name: &str) -> String;
}

/// Paginated, newest-first event log of one download-manager instance.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Lowercased instance name.
    fn instance(&self) -> &str;

    /// `page` starts at 1.
    async fn history_page(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<HistoryRecord>, AdapterError>;
}

/// Fetches an artifact by download handle into the artifact store.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    fn store(&self) -> &ArtifactStore;

    async fn fetch(&self, download_url: &str, file_name: &str)
        -> Result<StoredArtifact, ArtifactError>;
}

#[derive(Debug)]
pub struct ProwlarrClient {
    base_url: String,
    api_key: String,
    http: Arc<HttpFetcher>,
}

impl ProwlarrClient {
    pub fn new(base_url: &str, api_key: &str, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        }
    }

    fn request(&self, path: &str) -> HttpRequest {
        HttpRequest::get(format!("{}{}", self.base_url, path)).header(API_KEY_HEADER, &self.api_key)
    }
}

#[async_trait]
impl SearchIndex for ProwlarrClient {
    async fn search(&self, title: &str) -> Result<Vec<Candidate>, AdapterError> {
        let request = self.request("/api/v1/search").query("query", title);
        let body: JsonValue = self.http.fetch_json(SEARCH_INDEX_SOURCE, &request).await?;
        let JsonValue::Array(items) = body else {
            return Ok(Vec::new());
        };
        let candidates = items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<Candidate>(item) {
                Ok(candidate) => Some(candidate),
                Err(err) => {
                    debug!(error = %err, "skipping unparseable search result");
                    None
                }
            })
            .collect();
        Ok(candidates)
    }

    async fn list_indexers(&self) -> Result<Vec<IndexerInfo>, AdapterError> {
        let request = self.request("/api/v1/indexer");
        let body: JsonValue = self.http.fetch_json(SEARCH_INDEX_SOURCE, &request).await?;
        let JsonValue::Array(items) = body else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<IndexerInfo>(item).ok())
            .collect())
    }

    fn indexer_download_handle(&self, indexer_id: i64, locator: &str, file_name: &str) -> String {
        format!(
            "{}/api/v1/indexer/{}/download?link={}&file={}",
            self.base_url,
            indexer_id,
            percent_encode(locator),
            percent_encode(file_name)
        )
    }
}

fn percent_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Radarr/Sonarr v3 history API.
#[derive(Debug)]
pub struct ArrHistoryClient {
    instance: String,
    base_url: String,
    api_key: String,
    http: Arc<HttpFetcher>,
}

impl ArrHistoryClient {
    pub fn new(instance: &str, base_url: &str, api_key: &str, http: Arc<HttpFetcher>) -> Self {
        Self {
            instance: normalize_instance(instance),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        }
    }
}

#[async_trait]
impl HistorySource for ArrHistoryClient {
    fn instance(&self) -> &str {
        &self.instance
    }

    async fn history_page(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<HistoryRecord>, AdapterError> {
        let request = HttpRequest::get(format!("{}/api/v3/history", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .query("page", page)
            .query("pageSize", page_size)
            .query("sortKey", "date")
            .query("sortDirection", "descending");
        let body: JsonValue = self.http.fetch_json(&self.instance, &request).await?;
        Ok(extract_records(&body)
            .iter()
            .map(HistoryRecord::from_json)
            .collect())
    }
}

/// Streams artifacts over HTTP, reusing a stored file of the same name.
#[derive(Debug)]
pub struct HttpArtifactSource {
    http: Arc<HttpFetcher>,
    store: ArtifactStore,
    limits: ArtifactLimits,
}

impl HttpArtifactSource {
    pub fn new(http: Arc<HttpFetcher>, store: ArtifactStore, limits: ArtifactLimits) -> Self {
        Self {
            http,
            store,
            limits,
        }
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    fn store(&self) -> &ArtifactStore {
        &self.store
    }

    async fn fetch(
        &self,
        download_url: &str,
        file_name: &str,
    ) -> Result<StoredArtifact, ArtifactError> {
        match self.store.existing(file_name).await {
            Ok(Some(existing)) => return Ok(existing),
            Ok(None) => {}
            Err(err) => debug!(error = %err, "artifact lookup failed; downloading again"),
        }
        self.http
            .download_artifact(
                SEARCH_INDEX_SOURCE,
                &HttpRequest::get(download_url),
                &self.store,
                file_name,
                self.limits,
            )
            .await
    }
}

/// One raw history record, normalized across the field layouts the
/// download managers emit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Option<i64>,
    pub event_type: Option<String>,
    pub download_id: Option<String>,
    pub source_title: Option<String>,
    pub indexer: Option<String>,
    pub size: Option<i64>,
    pub info_url: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    pub fn from_json(record: &JsonValue) -> Self {
        let data = record.get("data").filter(|d| d.is_object());
        let nested = |key: &str| data.and_then(|d| d.get(key));
        let text = |value: Option<&JsonValue>| {
            value
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            id: lenient_i64(record.get("id")),
            event_type: text(record.get("eventType")),
            download_id: text(record.get("downloadId")),
            source_title: text(record.get("sourceTitle"))
                .or_else(|| text(nested("title")))
                .or_else(|| text(nested("releaseTitle"))),
            indexer: text(record.get("indexer")).or_else(|| text(nested("indexer"))),
            size: lenient_i64(record.get("size")).or_else(|| lenient_i64(nested("size"))),
            info_url: text(record.get("infoUrl"))
                .or_else(|| text(nested("infoUrl")))
                .or_else(|| text(nested("downloadUrl"))),
            date: text(record.get("date"))
                .or_else(|| text(record.get("grabbedAt")))
                .and_then(|s| parse_timestamp(&s)),
        }
    }

    pub fn to_ledger_entry(&self, instance: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            instance: normalize_instance(instance),
            raw_id: self.id,
            event_type: self.event_type.clone(),
            download_id: self.download_id.clone(),
            source_title: self.source_title.clone(),
            indexer: self.indexer.clone(),
            size: self.size,
            info_url: self.info_url.clone(),
            grabbed_at: self.date,
        }
    }
}

/// Records from a bare array or from the first array-valued container key.
pub fn extract_records(body: &JsonValue) -> Vec<JsonValue> {
    match body {
        JsonValue::Array(items) => items.clone(),
        JsonValue::Object(map) => RECORD_CONTAINER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn lenient_i64(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Inbound push notification from a download manager.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub download_id: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub application_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub release: Option<WebhookRelease>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRelease {
    #[serde(default)]
    pub release_title: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub indexer: Option<String>,
    #[serde(default, deserialize_with = "lenient_size")]
    pub size: Option<i64>,
    #[serde(default)]
    pub info_url: Option<String>,
}

/// Sizes arrive as numbers, numeric strings or junk; junk becomes `None`.
fn lenient_size<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(lenient_i64(value.as_ref()))
}

impl WebhookPayload {
    pub fn release_title(&self) -> Option<&str> {
        let release = self.release.as_ref();
        release
            .and_then(|r| r.release_title.as_deref())
            .or_else(|| release.and_then(|r| r.title.as_deref()))
            .or(self.title.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn instance(&self) -> String {
        self.instance_name
            .as_deref()
            .or(self.application_url.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(normalize_instance)
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn download_id(&self) -> &str {
        self.download_id.as_deref().unwrap_or("").trim()
    }

    pub fn indexer(&self) -> Option<&str> {
        self.release.as_ref().and_then(|r| r.indexer.as_deref())
    }

    pub fn size(&self) -> Option<i64> {
        self.release.as_ref().and_then(|r| r.size)
    }

    pub fn info_url(&self) -> Option<&str> {
        self.release.as_ref().and_then(|r| r.info_url.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexerCacheStats {
    pub count: usize,
    pub indexers: Vec<String>,
    pub age_seconds: Option<i64>,
}

#[derive(Debug)]
struct IndexerSnapshot {
    fetched_at: DateTime<Utc>,
    ids_by_name: HashMap<String, i64>,
}

/// Normalized indexer name -> indexer id, refreshed from the search index
/// once the snapshot is older than the TTL.
#[derive(Debug)]
pub struct IndexerCache {
    ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
    snapshot: Mutex<Option<IndexerSnapshot>>,
}

impl IndexerCache {
    pub fn new(ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::hours(1)),
            clock,
            snapshot: Mutex::new(None),
        }
    }

    fn lookup(&self, normalized: &str) -> Option<Option<i64>> {
        let guard = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        let snapshot = guard.as_ref()?;
        if self.clock.now() - snapshot.fetched_at > self.ttl {
            return None;
        }
        Some(snapshot.ids_by_name.get(normalized).copied())
    }

    /// Id for an indexer name; `None` when unknown or the listing failed.
    pub async fn resolve(&self, index: &dyn SearchIndex, name: &str) -> Option<i64> {
        let normalized = normalize_indexer(name);
        if normalized.is_empty() {
            return None;
        }
        if let Some(hit) = self.lookup(&normalized) {
            return hit;
        }

        let indexers = match index.list_indexers().await {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(error = %err, "listing indexers failed");
                return None;
            }
        };
        let ids_by_name: HashMap<String, i64> = indexers
            .into_iter()
            .map(|i| (normalize_indexer(&i.name), i.id))
            .filter(|(name, _)| !name.is_empty())
            .collect();
        let resolved = ids_by_name.get(&normalized).copied();
        *self.snapshot.lock().unwrap_or_else(|p| p.into_inner()) = Some(IndexerSnapshot {
            fetched_at: self.clock.now(),
            ids_by_name,
        });
        resolved
    }

    pub fn clear(&self) -> usize {
        let mut guard = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        let count = guard.as_ref().map(|s| s.ids_by_name.len()).unwrap_or(0);
        *guard = None;
        info!(count, "indexer cache cleared");
        count
    }

    pub fn stats(&self) -> IndexerCacheStats {
        let guard = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(snapshot) => {
                let mut indexers: Vec<String> = snapshot.ids_by_name.keys().cloned().collect();
                indexers.sort();
                IndexerCacheStats {
                    count: indexers.len(),
                    indexers,
                    age_seconds: Some((self.clock.now() - snapshot.fetched_at).num_seconds()),
                }
            }
            None => IndexerCacheStats {
                count: 0,
                indexers: Vec::new(),
                age_seconds: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use grb_core::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingIndex {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchIndex for CountingIndex {
        async fn search(&self, _title: &str) -> Result<Vec<Candidate>, AdapterError> {
            Ok(Vec::new())
        }

        async fn list_indexers(&self) -> Result<Vec<IndexerInfo>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                IndexerInfo { id: 7, name: "Example Tracker (Prowlarr)".into() },
                IndexerInfo { id: 9, name: "Other".into() },
            ])
        }

        fn indexer_download_handle(&self, indexer_id: i64, _locator: &str, _file: &str) -> String {
            format!("http://idx/{indexer_id}")
        }
    }

    #[test]
    fn records_are_found_under_known_keys() {
        assert_eq!(extract_records(&json!([{"id": 1}])).len(), 1);
        assert_eq!(extract_records(&json!({"records": [{"id": 1}, {"id": 2}]})).len(), 2);
        assert_eq!(extract_records(&json!({"items": [{"id": 1}]})).len(), 1);
        assert!(extract_records(&json!({"records": "nope"})).is_empty());
        assert!(extract_records(&json!(null)).is_empty());
    }

    #[test]
    fn history_record_uses_nested_fallbacks() {
        let record = HistoryRecord::from_json(&json!({
            "id": 12,
            "eventType": "grabbed",
            "downloadId": "ABC",
            "date": "2024-05-01T10:00:00Z",
            "data": {
                "releaseTitle": "Show.S01E01",
                "indexer": "Tracker",
                "size": "1024",
                "downloadUrl": "http://dl"
            }
        }));
        assert_eq!(record.id, Some(12));
        assert_eq!(record.source_title.as_deref(), Some("Show.S01E01"));
        assert_eq!(record.indexer.as_deref(), Some("Tracker"));
        assert_eq!(record.size, Some(1024));
        assert_eq!(record.info_url.as_deref(), Some("http://dl"));
        assert_eq!(
            record.date,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("ts"))
        );

        let entry = record.to_ledger_entry("Sonarr");
        assert_eq!(entry.instance, "sonarr");
        assert_eq!(entry.raw_id, Some(12));
    }

    #[test]
    fn top_level_fields_win_over_nested() {
        let record = HistoryRecord::from_json(&json!({
            "sourceTitle": "Top",
            "grabbedAt": "2024-05-01T10:00:00Z",
            "data": {"title": "Nested"}
        }));
        assert_eq!(record.source_title.as_deref(), Some("Top"));
        assert!(record.date.is_some());
    }

    #[test]
    fn webhook_payload_resolves_title_and_instance() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "eventType": "Grab",
            "downloadId": "abc",
            "instanceName": "Radarr",
            "release": {"title": "Fallback", "indexer": "X", "size": 10, "infoUrl": "https://x/y"}
        }))
        .expect("payload");
        assert_eq!(payload.release_title(), Some("Fallback"));
        assert_eq!(payload.instance(), "radarr");
        assert_eq!(payload.info_url(), Some("https://x/y"));

        let bare = WebhookPayload::default();
        assert_eq!(bare.instance(), "unknown");
        assert_eq!(bare.release_title(), None);
    }

    #[test]
    fn webhook_size_is_read_leniently() {
        let size_of = |size: serde_json::Value| {
            let payload: WebhookPayload = serde_json::from_value(json!({
                "eventType": "Grab",
                "release": {"releaseTitle": "Movie.2024.1080p", "size": size}
            }))
            .expect("payload");
            assert_eq!(payload.release_title(), Some("Movie.2024.1080p"));
            payload.size()
        };
        assert_eq!(size_of(json!("1500000000")), Some(1_500_000_000));
        assert_eq!(size_of(json!(1.5e9)), Some(1_500_000_000));
        assert_eq!(size_of(json!("about 1.4 GiB")), None);
        assert_eq!(size_of(json!(null)), None);
        assert_eq!(size_of(json!({"bytes": 1})), None);
    }

    #[test]
    fn download_handle_is_percent_encoded() {
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("http"));
        let client = ProwlarrClient::new("http://prowlarr:9696/", "key", http);
        assert_eq!(
            client.indexer_download_handle(3, "https://t/a?b=1", "A B.torrent"),
            "http://prowlarr:9696/api/v1/indexer/3/download?link=https%3A%2F%2Ft%2Fa%3Fb%3D1&file=A%20B.torrent"
        );
    }

    #[tokio::test]
    async fn indexer_cache_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts"),
        ));
        let cache = IndexerCache::new(std::time::Duration::from_secs(60), clock.clone());
        let index = CountingIndex { calls: AtomicUsize::new(0) };

        assert_eq!(cache.resolve(&index, "example tracker").await, Some(7));
        assert_eq!(cache.resolve(&index, "Example  Tracker").await, Some(7));
        assert_eq!(cache.resolve(&index, "missing").await, None);
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);

        clock.advance(ChronoDuration::seconds(61));
        assert_eq!(cache.resolve(&index, "other").await, Some(9));
        assert_eq!(index.calls.load(Ordering::SeqCst), 2);

        assert_eq!(cache.stats().count, 2);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().age_seconds, None);
    }
}
