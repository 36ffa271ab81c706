//! The shared ingestion path used by webhooks, the history poller and manual
//! recovery: search, score, fetch, verify, upsert.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use grb_adapters::{
    ArtifactSource, HttpArtifactSource, IndexerCache, ProwlarrClient, SearchIndex, WebhookPayload,
};
use grb_core::{
    abbreviate_download_id, is_grab_event, normalize_download_id, Candidate, ErrorKind, HashCheck,
    HistoryEntry, IngestMode, IngestResult, IngestSource, NewGrab, NewHistoryEntry,
};
use grb_storage::{verify_artifact, ArtifactError, ArtifactStore, HttpFetcher, StoredArtifact};
use tracing::{info, info_span, warn, Instrument};

use crate::config::{HistorySettings, SyncConfig, WebhookSettings};
use crate::matcher::{select_candidate, MatchDecision, MatchQuery};
use crate::store::{GrabStore, UpsertOutcome};

pub const REASON_MISSING_TITLE: &str = "missing releaseTitle";
pub const REASON_NO_CANDIDATES: &str = "no candidates";
pub const REASON_SCORE_TOO_LOW: &str = "score too low";
pub const REASON_MISSING_DOWNLOAD_URL: &str = "missing downloadUrl";
pub const REASON_HASH_MISMATCH: &str = "hash mismatch";

/// One grab as seen by any ingestion path.
#[derive(Debug, Clone)]
pub struct GrabEvent {
    pub instance: String,
    pub source: IngestSource,
    pub title: String,
    pub download_id: Option<String>,
    pub indexer: Option<String>,
    pub size: Option<i64>,
    pub info_url: Option<String>,
    pub grabbed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub min_score: i32,
    pub strict: bool,
    pub download: bool,
    pub allow_download_for_history: bool,
    /// Keep a `missing` row when no candidate is good enough.
    pub allow_missing_candidate: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            min_score: 3,
            strict: true,
            download: true,
            allow_download_for_history: false,
            allow_missing_candidate: false,
        }
    }
}

impl IngestOptions {
    pub fn for_webhook(settings: &WebhookSettings) -> Self {
        Self {
            min_score: settings.min_score,
            strict: settings.strict,
            download: settings.download,
            allow_download_for_history: false,
            allow_missing_candidate: false,
        }
    }

    pub fn for_history_sync(settings: &HistorySettings) -> Self {
        Self {
            min_score: settings.min_score,
            strict: settings.strict_hash,
            download: settings.download_from_history,
            allow_download_for_history: settings.download_from_history,
            allow_missing_candidate: true,
        }
    }

    pub fn for_recovery(min_score: i32, strict: bool, download: bool) -> Self {
        Self {
            min_score,
            strict,
            download,
            allow_download_for_history: true,
            allow_missing_candidate: false,
        }
    }

    pub fn effective_download(&self, source: IngestSource) -> bool {
        self.download && (source != IngestSource::HistorySync || self.allow_download_for_history)
    }
}

pub struct Ingestor {
    store: GrabStore,
    search: Option<Arc<dyn SearchIndex>>,
    artifacts: Arc<dyn ArtifactSource>,
    indexers: Arc<IndexerCache>,
}

impl Ingestor {
    pub fn new(
        store: GrabStore,
        search: Option<Arc<dyn SearchIndex>>,
        artifacts: Arc<dyn ArtifactSource>,
        indexers: Arc<IndexerCache>,
    ) -> Self {
        Self {
            store,
            search,
            artifacts,
            indexers,
        }
    }

    /// Wire the real search index and artifact downloader from configuration.
    pub fn from_config(config: &SyncConfig, store: GrabStore, http: Arc<HttpFetcher>) -> Self {
        let search = config.search_index().map(|(url, key)| {
            Arc::new(ProwlarrClient::new(url, key, http.clone())) as Arc<dyn SearchIndex>
        });
        let artifacts = Arc::new(HttpArtifactSource::new(
            http,
            ArtifactStore::new(config.torrent_dir.clone()),
            config.artifact_limits(),
        ));
        let indexers = Arc::new(IndexerCache::new(
            config.indexer_cache_ttl,
            store.clock().clone(),
        ));
        Self::new(store, search, artifacts, indexers)
    }

    pub fn store(&self) -> &GrabStore {
        &self.store
    }

    pub fn indexer_cache(&self) -> &IndexerCache {
        &self.indexers
    }

    pub async fn ingest_grab_event(&self, event: &GrabEvent, options: &IngestOptions) -> IngestResult {
        let span = info_span!("ingest_grab", source = %event.source, instance = %event.instance);
        self.ingest_inner(event, options).instrument(span).await
    }

    async fn ingest_inner(&self, event: &GrabEvent, options: &IngestOptions) -> IngestResult {
        let title = event.title.trim();
        if title.is_empty() {
            return IngestResult::error(ErrorKind::MissingTitle, REASON_MISSING_TITLE);
        }
        let download_id = event.download_id.as_deref().and_then(normalize_download_id);
        info!(
            title,
            download_id = %abbreviate_download_id(download_id.as_deref()),
            "ingesting grab"
        );

        let candidates = self.search_candidates(title).await;
        info!(count = candidates.len(), "search index returned candidates");

        let effective_download = options.effective_download(event.source);
        if options.download && !effective_download {
            info!("artifact download disabled for history sync");
        }

        let query = MatchQuery {
            title,
            download_id: download_id.as_deref(),
            indexer: event.indexer.as_deref(),
            size: event.size,
        };
        let best = match select_candidate(&query, candidates, options.min_score) {
            MatchDecision::Accepted(best) => best,
            MatchDecision::NoCandidates if options.allow_missing_candidate => {
                return self.insert_minimal(event, download_id, event.info_url.clone(), None).await;
            }
            MatchDecision::NoCandidates => {
                return IngestResult::error(ErrorKind::NoCandidateFound, REASON_NO_CANDIDATES);
            }
            MatchDecision::BelowThreshold(best) if options.allow_missing_candidate => {
                let fallback = event
                    .info_url
                    .clone()
                    .or_else(|| best.candidate.download_url.clone());
                return self
                    .insert_minimal(event, download_id, fallback, Some(best.score))
                    .await;
            }
            MatchDecision::BelowThreshold(best) => {
                info!(score = best.score, min_score = options.min_score, "best candidate below threshold");
                return IngestResult::error(ErrorKind::ScoreBelowThreshold, REASON_SCORE_TOO_LOW)
                    .with_score(best.score);
            }
        };

        let candidate = &best.candidate;
        let download_url = candidate
            .download_url
            .clone()
            .filter(|u| !u.trim().is_empty());
        if download_url.is_none() && !options.allow_missing_candidate {
            return IngestResult::error(ErrorKind::MissingDownloadHandle, REASON_MISSING_DOWNLOAD_URL)
                .with_score(best.score);
        }

        let mut stored: Option<StoredArtifact> = None;
        if let (true, Some(url)) = (effective_download, download_url.as_deref()) {
            info!(score = best.score, "fetching artifact");
            let file_name = ArtifactStore::torrent_file_name(candidate.title.as_deref().unwrap_or(title));
            match self.artifacts.fetch(url, &file_name).await {
                Ok(artifact) => stored = Some(artifact),
                Err(err) => {
                    warn!(error = %err, "artifact fetch failed");
                    return IngestResult::error(artifact_error_kind(&err), err.to_string())
                        .with_score(best.score)
                        .with_download_url(download_url);
                }
            }
        }

        let hash_check = match (&stored, download_id.as_deref()) {
            (Some(artifact), Some(expected)) => {
                let check = self.verify(artifact, expected).await;
                if options.strict && !check.matched {
                    self.discard(artifact).await;
                    return IngestResult::error(ErrorKind::HashMismatch, REASON_HASH_MISMATCH)
                        .with_score(best.score)
                        .with_hash_check(Some(check));
                }
                Some(check)
            }
            _ => None,
        };

        let tracker = candidate.indexer.clone().or_else(|| event.indexer.clone());
        let grab = NewGrab {
            legacy_id: None,
            download_id,
            instance: event.instance.clone(),
            source: event.source,
            title: candidate.title.clone().unwrap_or_else(|| title.to_string()),
            source_url: download_url
                .clone()
                .or_else(|| event.info_url.clone())
                .unwrap_or_default(),
            artifact_path: stored.map(|a| a.file_name),
            tracker: tracker.clone(),
            indexer_id: candidate.indexer_id,
            grabbed_at: event.grabbed_at.unwrap_or_else(|| self.store.clock().now()),
        };
        let outcome = self.store.upsert_grab(&grab).await;
        if !outcome.is_success() {
            return upsert_failure(&outcome).with_score(best.score);
        }

        IngestResult::ok(IngestMode::Full)
            .with_score(best.score)
            .with_download_url(download_url)
            .with_hash_check(hash_check)
            .with_indexer(tracker)
            .with_message(outcome.message())
    }

    async fn search_candidates(&self, title: &str) -> Vec<Candidate> {
        let Some(search) = &self.search else {
            warn!("search index not configured; no candidates");
            return Vec::new();
        };
        match search.search(title).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "search index query failed");
                Vec::new()
            }
        }
    }

    async fn verify(&self, artifact: &StoredArtifact, expected: &str) -> HashCheck {
        let check = verify_artifact(&artifact.absolute_path, expected).await;
        info!(
            matched = check.matched,
            download_id = %abbreviate_download_id(Some(&check.expected)),
            info_hash = %abbreviate_download_id(check.computed.as_deref()),
            "artifact hash verified"
        );
        check
    }

    async fn discard(&self, artifact: &StoredArtifact) {
        if let Err(err) = self.artifacts.store().remove(&artifact.file_name).await {
            warn!(file = %artifact.file_name, error = %err, "could not delete rejected artifact");
        }
    }

    /// Keep the grab without a verified artifact.
    async fn insert_minimal(
        &self,
        event: &GrabEvent,
        download_id: Option<String>,
        fallback_url: Option<String>,
        score: Option<i32>,
    ) -> IngestResult {
        let grab = NewGrab {
            legacy_id: None,
            download_id,
            instance: event.instance.clone(),
            source: event.source,
            title: event.title.trim().to_string(),
            source_url: fallback_url.clone().unwrap_or_default(),
            artifact_path: None,
            tracker: event.indexer.clone(),
            indexer_id: None,
            grabbed_at: event.grabbed_at.unwrap_or_else(|| self.store.clock().now()),
        };
        let outcome = self.store.upsert_grab(&grab).await;
        if !outcome.is_success() {
            return upsert_failure(&outcome);
        }
        info!(score = ?score, "stored minimal grab without artifact");
        let result = IngestResult::ok(IngestMode::Minimal)
            .with_download_url(fallback_url)
            .with_indexer(event.indexer.clone())
            .with_message(outcome.message());
        match score {
            Some(score) => result.with_score(score),
            None => result,
        }
    }

    /// Push notification from a download manager.
    pub async fn handle_webhook_grab(
        &self,
        payload: &WebhookPayload,
        settings: &WebhookSettings,
    ) -> IngestResult {
        let event_type = payload.event_type.as_deref();
        if !is_grab_event(event_type) {
            info!(event_type = ?event_type, "ignoring webhook event");
            return IngestResult::ignored("eventType", payload.event_type.clone());
        }
        let Some(title) = payload.release_title() else {
            warn!("webhook without release title");
            return IngestResult::error(ErrorKind::MissingTitle, REASON_MISSING_TITLE);
        };

        let instance = payload.instance();
        let download_id = payload.download_id();
        info!(
            %instance,
            title,
            download_id = %abbreviate_download_id(Some(download_id)),
            "webhook grab received"
        );

        let now = self.store.clock().now();
        let ledger_entry = NewHistoryEntry {
            instance: instance.clone(),
            raw_id: None,
            event_type: Some("grabbed".to_string()),
            download_id: normalize_download_id(download_id),
            source_title: Some(title.to_string()),
            indexer: payload.indexer().map(str::to_string),
            size: payload.size(),
            info_url: payload.info_url().map(str::to_string),
            grabbed_at: Some(now),
        };
        if let Err(err) = self.store.upsert_history(&[ledger_entry]).await {
            warn!(error = %err, "webhook grab not recorded in history ledger");
        }

        let event = GrabEvent {
            instance,
            source: IngestSource::Webhook,
            title: title.to_string(),
            download_id: normalize_download_id(download_id),
            indexer: payload.indexer().map(str::to_string),
            size: payload.size(),
            info_url: payload.info_url().map(str::to_string),
            grabbed_at: Some(now),
        };
        let result = self
            .ingest_grab_event(&event, &IngestOptions::for_webhook(settings))
            .await;
        if result.is_ok() {
            info!(title, "webhook grab stored");
        }
        result
    }

    /// Operator-driven catch-up for one ledger entry, falling back to a
    /// direct indexer download when the search index finds nothing usable.
    pub async fn recover_from_history(
        &self,
        entry: &HistoryEntry,
        min_score: i32,
        strict: bool,
        download: bool,
    ) -> IngestResult {
        let title = entry
            .source_title
            .clone()
            .or_else(|| entry.download_id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let instance = if entry.instance.trim().is_empty() {
            "history_reconcile".to_string()
        } else {
            entry.instance.clone()
        };
        let event = GrabEvent {
            instance: instance.clone(),
            source: IngestSource::HistoryManual,
            title: title.clone(),
            download_id: entry.download_id.clone(),
            indexer: entry.indexer.clone(),
            size: entry.size,
            info_url: entry.info_url.clone(),
            grabbed_at: entry.grabbed_at,
        };
        let options = IngestOptions::for_recovery(min_score, strict, download);
        let result = self.ingest_grab_event(&event, &options).await;
        if result.is_ok() {
            return result.with_indexer(entry.indexer.clone()).with_fallback(false);
        }

        let not_recovered = result.with_indexer(entry.indexer.clone()).with_fallback(false);
        let (Some(info_url), Some(indexer)) = (entry.info_url.as_deref(), entry.indexer.as_deref()) else {
            return not_recovered;
        };
        let Some(search) = self.search.as_deref() else {
            return not_recovered;
        };
        if !download {
            return not_recovered;
        }

        info!(indexer, "recovering through direct indexer download");
        let Some(indexer_id) = self.indexers.resolve(search, indexer).await else {
            warn!(indexer, "indexer id not found; recovery abandoned");
            return not_recovered;
        };
        let file_name = ArtifactStore::torrent_file_name(&title);
        let handle = search.indexer_download_handle(indexer_id, info_url, &file_name);
        let artifact = match self.artifacts.fetch(&handle, &file_name).await {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(error = %err, "indexer download failed");
                return not_recovered;
            }
        };

        let download_id = entry.download_id.as_deref().and_then(normalize_download_id);
        let mut hash_check = None;
        if let Some(expected) = download_id.as_deref() {
            let check = self.verify(&artifact, expected).await;
            if strict && !check.matched {
                self.discard(&artifact).await;
                warn!("recovered artifact rejected: hash mismatch");
                return IngestResult::error(ErrorKind::HashMismatch, REASON_HASH_MISMATCH)
                    .with_hash_check(Some(check))
                    .with_fallback(true)
                    .with_indexer(entry.indexer.clone());
            }
            hash_check = Some(check);
        }

        let grab = NewGrab {
            legacy_id: None,
            download_id,
            instance,
            source: IngestSource::HistoryManual,
            title: title.clone(),
            source_url: handle.clone(),
            artifact_path: Some(artifact.file_name),
            tracker: Some(indexer.to_string()),
            indexer_id: Some(indexer_id),
            grabbed_at: entry.grabbed_at.unwrap_or_else(|| self.store.clock().now()),
        };
        let outcome = self.store.upsert_grab(&grab).await;
        if !outcome.is_success() {
            return upsert_failure(&outcome)
                .with_fallback(true)
                .with_indexer(entry.indexer.clone());
        }
        info!(title = %title, "grab recovered through indexer");
        IngestResult::ok(IngestMode::Full)
            .with_download_url(Some(handle))
            .with_hash_check(hash_check)
            .with_fallback(true)
            .with_indexer(entry.indexer.clone())
            .with_message(outcome.message())
    }
}

fn upsert_failure(outcome: &UpsertOutcome) -> IngestResult {
    let kind = match outcome {
        UpsertOutcome::Failed { kind, .. } => *kind,
        _ => ErrorKind::Store,
    };
    warn!(reason = %outcome.message(), "canonical store rejected grab");
    IngestResult::error(kind, outcome.message())
}

fn artifact_error_kind(err: &ArtifactError) -> ErrorKind {
    match err {
        err if err.is_invalid_content() => ErrorKind::InvalidArtifactContent,
        ArtifactError::Fetch(fetch) if fetch.is_transient() => ErrorKind::TransientNetworkError,
        ArtifactError::Fetch(_) => ErrorKind::PermanentNetworkError,
        _ => ErrorKind::Store,
    }
}
