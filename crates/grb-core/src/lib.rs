//! Core domain model for GRB: canonical grabs, the history ledger, cursors and
//! the structured ingestion outcome shared by every ingestion path.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "grb-core";

/// Event types a webhook may carry for a grab.
pub const GRAB_EVENT_TYPES: [&str; 3] = ["Grab", "Grabbed", "grab"];

/// Noise suffixes some search indexes append to indexer names.
const INDEXER_NOISE_TOKENS: [&str; 2] = ["(Prowlarr)", "(API)"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabStatus {
    Downloaded,
    Missing,
}

impl GrabStatus {
    /// A grab is `downloaded` iff it holds a non-empty artifact path.
    pub fn for_artifact(artifact_path: Option<&str>) -> Self {
        match artifact_path {
            Some(path) if !path.trim().is_empty() => Self::Downloaded,
            _ => Self::Missing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::Missing => "missing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "downloaded" => Some(Self::Downloaded),
            "missing" => Some(Self::Missing),
            _ => None,
        }
    }
}

/// Provenance tag for the path that produced an ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestSource {
    Webhook,
    HistorySync,
    HistoryManual,
}

impl IngestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::HistorySync => "history_sync",
            Self::HistoryManual => "history_manual",
        }
    }
}

impl fmt::Display for IngestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical persisted grab: one row per real download decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grab {
    pub id: i64,
    pub legacy_id: Option<i64>,
    pub download_id: Option<String>,
    pub instance: String,
    pub title: String,
    pub source_url: String,
    pub artifact_path: Option<String>,
    pub tracker: Option<String>,
    pub indexer_id: Option<i64>,
    pub status: GrabStatus,
    pub first_seen_source: String,
    pub last_seen_source: String,
    pub grabbed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Write contract into the canonical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGrab {
    pub legacy_id: Option<i64>,
    pub download_id: Option<String>,
    pub instance: String,
    pub source: IngestSource,
    pub title: String,
    pub source_url: String,
    pub artifact_path: Option<String>,
    pub tracker: Option<String>,
    pub indexer_id: Option<i64>,
    pub grabbed_at: DateTime<Utc>,
}

impl NewGrab {
    /// Canonical identity `(instance, download_id)` when the download id is present.
    pub fn canonical_identity(&self) -> Option<(String, String)> {
        let download_id = normalize_download_id(self.download_id.as_deref()?)?;
        Some((normalize_instance(&self.instance), download_id))
    }

    pub fn status(&self) -> GrabStatus {
        GrabStatus::for_artifact(self.artifact_path.as_deref())
    }
}

/// One raw event observed in an instance's polled history (the ledger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub instance: String,
    pub raw_id: Option<i64>,
    pub event_type: Option<String>,
    pub download_id: Option<String>,
    pub source_title: Option<String>,
    pub indexer: Option<String>,
    pub size: Option<i64>,
    pub info_url: Option<String>,
    pub grabbed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewHistoryEntry {
    pub instance: String,
    pub raw_id: Option<i64>,
    pub event_type: Option<String>,
    pub download_id: Option<String>,
    pub source_title: Option<String>,
    pub indexer: Option<String>,
    pub size: Option<i64>,
    pub info_url: Option<String>,
    pub grabbed_at: Option<DateTime<Utc>>,
}

/// Release description returned by the search index for a title query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub indexer: Option<String>,
    #[serde(default)]
    pub indexer_id: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub info_hash: Option<String>,
    #[serde(default, rename = "infoHashV1")]
    pub info_hash_v1: Option<String>,
    #[serde(default)]
    pub download_id: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub info_url: Option<String>,
}

impl Candidate {
    /// First non-empty hash-like field, in the order the search index fills them.
    pub fn content_hash(&self) -> Option<&str> {
        [
            &self.info_hash,
            &self.info_hash_v1,
            &self.download_id,
            &self.hash,
        ]
        .into_iter()
        .filter_map(|v| v.as_deref())
        .map(str::trim)
        .find(|v| !v.is_empty())
    }
}

/// `{expected, computed, match}` triple produced by artifact verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashCheck {
    #[serde(rename = "downloadId")]
    pub expected: String,
    #[serde(rename = "infoHash")]
    pub computed: Option<String>,
    #[serde(rename = "match")]
    pub matched: bool,
}

impl HashCheck {
    pub fn new(expected: &str, computed: Option<String>) -> Self {
        let expected = expected.trim().to_ascii_uppercase();
        let computed = computed.map(|c| c.trim().to_ascii_uppercase());
        let matched = computed.as_deref().is_some_and(|c| c == expected);
        Self {
            expected,
            computed,
            matched,
        }
    }
}

/// Per-instance resumption watermark over `(grabbed_at, raw_id)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    pub grabbed_at: Option<DateTime<Utc>>,
    pub raw_id: Option<i64>,
}

impl HistoryCursor {
    pub fn new(grabbed_at: DateTime<Utc>, raw_id: Option<i64>) -> Self {
        Self {
            grabbed_at: Some(grabbed_at),
            raw_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.grabbed_at.is_none()
    }

    /// Namespaced configuration key holding the cursor of `instance`.
    pub fn config_key(instance: &str) -> String {
        format!("HISTORY_CURSOR::{}", normalize_instance(instance))
    }

    /// `"<ISO8601 timestamp>|<raw_id or empty>"`; `None` when there is no timestamp.
    pub fn encode(&self) -> Option<String> {
        let ts = self.grabbed_at?;
        let raw = self.raw_id.map(|id| id.to_string()).unwrap_or_default();
        Some(format!("{}|{}", format_timestamp(ts), raw))
    }

    /// Unparseable values decode to the empty cursor.
    pub fn decode(raw: &str) -> Self {
        let Some((ts, id)) = raw.split_once('|') else {
            return Self::default();
        };
        let Some(grabbed_at) = parse_timestamp(ts) else {
            return Self::default();
        };
        let raw_id = if id.trim().is_empty() {
            None
        } else {
            match id.trim().parse::<i64>() {
                Ok(v) => Some(v),
                Err(_) => return Self::default(),
            }
        };
        Self {
            grabbed_at: Some(grabbed_at),
            raw_id,
        }
    }

    /// Strictly newer than this cursor: later timestamp, or same timestamp and a
    /// larger raw id. An empty cursor admits everything; a record without a
    /// timestamp is never newer than a non-empty cursor.
    pub fn admits(&self, grabbed_at: Option<DateTime<Utc>>, raw_id: Option<i64>) -> bool {
        let Some(cursor_ts) = self.grabbed_at else {
            return true;
        };
        let Some(ts) = grabbed_at else {
            return false;
        };
        match ts.cmp(&cursor_ts) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (self.raw_id, raw_id) {
                (Some(cursor_id), Some(id)) => id > cursor_id,
                _ => false,
            },
        }
    }

    /// Raise the watermark to include `(grabbed_at, raw_id)`; never moves backward.
    pub fn observe(&mut self, grabbed_at: Option<DateTime<Utc>>, raw_id: Option<i64>) {
        let Some(ts) = grabbed_at else {
            return;
        };
        let candidate = Self::new(ts, raw_id);
        if candidate > *self {
            *self = candidate;
        }
    }
}

impl PartialOrd for HistoryCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HistoryCursor {
    // Option ordering puts None first, so an empty cursor is the minimum and a
    // missing raw id sorts below any numeric id at the same timestamp.
    fn cmp(&self, other: &Self) -> Ordering {
        self.grabbed_at
            .cmp(&other.grabbed_at)
            .then(self.raw_id.cmp(&other.raw_id))
    }
}

/// Error taxonomy for the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingTitle,
    NoCandidateFound,
    ScoreBelowThreshold,
    MissingDownloadHandle,
    HashMismatch,
    InvalidArtifactContent,
    TransientStoreContention,
    TransientNetworkError,
    PermanentNetworkError,
    SchemaMigrationError,
    Store,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientStoreContention | Self::TransientNetworkError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ok,
    Error,
    Ignored,
}

/// `full` rows hold a matched candidate; `minimal` rows were kept without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    Full,
    Minimal,
}

/// Per-event structured outcome of an ingestion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<IngestMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_check: Option<HashCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub fallback_used: bool,
}

impl IngestResult {
    pub fn ok(mode: IngestMode) -> Self {
        Self {
            status: IngestStatus::Ok,
            kind: None,
            reason: None,
            mode: Some(mode),
            score: None,
            download_url: None,
            hash_check: None,
            indexer: None,
            event_type: None,
            message: None,
            fallback_used: false,
        }
    }

    pub fn error(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            status: IngestStatus::Error,
            kind: Some(kind),
            reason: Some(reason.into()),
            mode: None,
            ..Self::ok(IngestMode::Full)
        }
    }

    pub fn ignored(reason: impl Into<String>, event_type: Option<String>) -> Self {
        Self {
            status: IngestStatus::Ignored,
            reason: Some(reason.into()),
            mode: None,
            event_type,
            ..Self::ok(IngestMode::Full)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == IngestStatus::Ok
    }

    pub fn with_score(mut self, score: i32) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_indexer(mut self, indexer: Option<String>) -> Self {
        self.indexer = indexer;
        self
    }

    pub fn with_hash_check(mut self, hash_check: Option<HashCheck>) -> Self {
        self.hash_check = hash_check;
        self
    }

    pub fn with_download_url(mut self, url: Option<String>) -> Self {
        self.download_url = url;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_fallback(mut self, used: bool) -> Self {
        self.fallback_used = used;
        self
    }
}

/// Time source injected into components that expire or window data.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Lowercase, strip indexer noise tokens, collapse whitespace.
pub fn normalize_indexer(value: &str) -> String {
    let mut text = value.trim().to_string();
    for token in INDEXER_NOISE_TOKENS {
        text = text.replace(token, "");
    }
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalize_instance(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Uppercase, trimmed; `None` for blank input.
pub fn normalize_download_id(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_uppercase())
    }
}

/// `ABCDEF012345…` form used in log lines.
pub fn abbreviate_download_id(value: Option<&str>) -> String {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) if v.chars().count() > 12 => format!("{}…", v.chars().take(12).collect::<String>()),
        Some(v) => v.to_string(),
        None => "n/a".to_string(),
    }
}

pub fn is_grab_event(event_type: Option<&str>) -> bool {
    event_type.is_some_and(|t| GRAB_EVENT_TYPES.contains(&t))
}

/// Storage form: RFC 3339, UTC, millisecond precision, `Z` suffix.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lenient parse: RFC 3339 with offset, or naive ISO 8601 taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).single().expect("ts")
    }

    #[test]
    fn cursor_encodes_and_decodes() {
        let cursor = HistoryCursor::new(ts(10, 30), Some(42));
        let encoded = cursor.encode().expect("encoded");
        assert_eq!(encoded, "2024-05-01T10:30:00.000Z|42");
        assert_eq!(HistoryCursor::decode(&encoded), cursor);

        let no_id = HistoryCursor::new(ts(10, 30), None);
        assert_eq!(no_id.encode().as_deref(), Some("2024-05-01T10:30:00.000Z|"));
        assert_eq!(HistoryCursor::decode("2024-05-01T10:30:00.000Z|"), no_id);
        assert!(HistoryCursor::default().encode().is_none());
    }

    #[test]
    fn garbage_cursor_decodes_to_empty() {
        assert!(HistoryCursor::decode("nope").is_empty());
        assert!(HistoryCursor::decode("not-a-date|3").is_empty());
        assert!(HistoryCursor::decode("2024-05-01T10:30:00Z|abc").is_empty());
    }

    #[test]
    fn cursor_admits_only_strictly_newer_records() {
        let cursor = HistoryCursor::new(ts(10, 0), Some(5));
        assert!(cursor.admits(Some(ts(10, 1)), None));
        assert!(!cursor.admits(Some(ts(9, 59)), Some(100)));
        assert!(cursor.admits(Some(ts(10, 0)), Some(6)));
        assert!(!cursor.admits(Some(ts(10, 0)), Some(5)));
        assert!(!cursor.admits(Some(ts(10, 0)), None));
        assert!(!cursor.admits(None, Some(99)));
        assert!(HistoryCursor::default().admits(None, None));
    }

    #[test]
    fn cursor_observe_never_moves_backward() {
        let mut cursor = HistoryCursor::new(ts(10, 0), Some(5));
        cursor.observe(Some(ts(9, 0)), Some(500));
        assert_eq!(cursor, HistoryCursor::new(ts(10, 0), Some(5)));
        cursor.observe(Some(ts(10, 0)), Some(7));
        assert_eq!(cursor.raw_id, Some(7));
        cursor.observe(Some(ts(11, 0)), None);
        assert_eq!(cursor, HistoryCursor::new(ts(11, 0), None));
        cursor.observe(None, Some(1_000));
        assert_eq!(cursor.grabbed_at, Some(ts(11, 0)));
    }

    #[test]
    fn cursor_key_is_namespaced_and_lowercased() {
        assert_eq!(HistoryCursor::config_key(" Radarr "), "HISTORY_CURSOR::radarr");
    }

    #[test]
    fn indexer_normalization_strips_noise() {
        assert_eq!(normalize_indexer("  Example   Tracker (Prowlarr) "), "example tracker");
        assert_eq!(normalize_indexer("YggAPI (API)"), "yggapi");
        assert_eq!(normalize_indexer(""), "");
    }

    #[test]
    fn status_follows_artifact_path() {
        assert_eq!(GrabStatus::for_artifact(Some("a.torrent")), GrabStatus::Downloaded);
        assert_eq!(GrabStatus::for_artifact(Some("  ")), GrabStatus::Missing);
        assert_eq!(GrabStatus::for_artifact(None), GrabStatus::Missing);
    }

    #[test]
    fn hash_check_compares_case_insensitively() {
        let check = HashCheck::new("abcdef", Some("ABCDEF".into()));
        assert!(check.matched);
        assert_eq!(check.expected, "ABCDEF");
        assert!(!HashCheck::new("abcdef", None).matched);
        let json = serde_json::to_value(&check).expect("json");
        assert_eq!(json["match"], true);
        assert_eq!(json["downloadId"], "ABCDEF");
    }

    #[test]
    fn candidate_hash_prefers_info_hash_fields() {
        let candidate: Candidate = serde_json::from_value(serde_json::json!({
            "title": "Movie",
            "infoHash": "",
            "infoHashV1": "aa11",
            "hash": "bb22",
            "downloadUrl": "http://x/dl"
        }))
        .expect("candidate");
        assert_eq!(candidate.content_hash(), Some("aa11"));
        assert_eq!(candidate.download_url.as_deref(), Some("http://x/dl"));
    }

    #[test]
    fn timestamps_parse_leniently() {
        assert_eq!(parse_timestamp("2024-05-01T10:30:00Z"), Some(ts(10, 30)));
        assert_eq!(parse_timestamp("2024-05-01T12:30:00+02:00"), Some(ts(10, 30)));
        assert_eq!(parse_timestamp("2024-05-01T10:30:00"), Some(ts(10, 30)));
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(format_timestamp(ts(10, 30)), "2024-05-01T10:30:00.000Z");
    }

    #[test]
    fn result_serializes_compact() {
        let result = IngestResult::error(ErrorKind::ScoreBelowThreshold, "score too low").with_score(2);
        let json = serde_json::to_value(&result).expect("json");
        assert_eq!(json["status"], "error");
        assert_eq!(json["reason"], "score too low");
        assert_eq!(json["score"], 2);
        assert!(json.get("mode").is_none());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(ts(1, 0));
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), ts(1, 5));
    }
}
