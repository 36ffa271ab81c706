mod common;

use common::{candidate, torrent, FakeSearchIndex, Harness};
use grb_adapters::WebhookPayload;
use grb_core::{ErrorKind, GrabStatus, IngestMode, IngestSource, IngestStatus};
use grb_sync::{GrabEvent, IngestOptions, WebhookSettings};
use serde_json::json;

const TITLE: &str = "Movie.2024.1080p";
const URL: &str = "http://prowlarr.test/dl/1";

fn webhook(download_id: &str) -> WebhookPayload {
    serde_json::from_value(json!({
        "eventType": "Grab",
        "downloadId": download_id,
        "instanceName": "Radarr",
        "release": {
            "releaseTitle": TITLE,
            "indexer": "ExampleTracker",
            "size": 1_500_000_000i64,
            "infoUrl": "https://x/y"
        }
    }))
    .unwrap()
}

fn settings() -> WebhookSettings {
    WebhookSettings {
        min_score: 3,
        strict: true,
        download: true,
    }
}

#[tokio::test]
async fn webhook_grab_is_scored_fetched_verified_and_stored() {
    let (bytes, hash) = torrent("movie");
    let h = Harness::new(FakeSearchIndex::with(vec![candidate(
        TITLE,
        "ExampleTracker",
        Some(&hash),
        URL,
    )]))
    .await;
    h.artifacts.serve(URL, bytes);

    let result = h.ingestor.handle_webhook_grab(&webhook(&hash), &settings()).await;
    assert_eq!(result.status, IngestStatus::Ok, "{result:?}");
    assert_eq!(result.score, Some(6));
    assert_eq!(result.mode, Some(IngestMode::Full));
    assert!(result.hash_check.as_ref().unwrap().matched);

    let grab = h.store.find_grab("radarr", &hash).await.unwrap().unwrap();
    assert_eq!(grab.status, GrabStatus::Downloaded);
    assert_eq!(grab.artifact_path.as_deref(), Some("Movie.2024.1080p.torrent"));
    assert_eq!(grab.first_seen_source, "webhook");
    assert_eq!(grab.tracker.as_deref(), Some("ExampleTracker"));
    assert!(h.artifact_path("Movie.2024.1080p.torrent").exists());

    let ledger = h
        .store
        .get_history_record(&hash, Some("radarr"))
        .await
        .unwrap()
        .expect("webhook grab lands in the ledger");
    assert_eq!(ledger.raw_id, None);
    assert_eq!(ledger.event_type.as_deref(), Some("grabbed"));
}

#[tokio::test]
async fn repeated_ingestion_keeps_one_row_and_first_seen_source() {
    let (bytes, hash) = torrent("movie");
    let h = Harness::new(FakeSearchIndex::with(vec![candidate(
        TITLE,
        "ExampleTracker",
        Some(&hash),
        URL,
    )]))
    .await;
    h.artifacts.serve(URL, bytes);

    let first = h.ingestor.handle_webhook_grab(&webhook(&hash), &settings()).await;
    assert!(first.is_ok());

    let event = GrabEvent {
        instance: "radarr".into(),
        source: IngestSource::HistoryManual,
        title: TITLE.into(),
        download_id: Some(hash.to_lowercase()),
        indexer: Some("ExampleTracker".into()),
        size: None,
        info_url: None,
        grabbed_at: None,
    };
    let second = h
        .ingestor
        .ingest_grab_event(&event, &IngestOptions::for_recovery(3, true, true))
        .await;
    assert!(second.is_ok(), "{second:?}");
    assert_eq!(second.message.as_deref(), Some("updated (idempotent)"));

    assert_eq!(h.store.count_grabs().await.unwrap(), 1);
    let grab = h.store.find_grab("radarr", &hash).await.unwrap().unwrap();
    assert_eq!(grab.first_seen_source, "webhook");
    assert_eq!(grab.last_seen_source, "history_manual");
}

#[tokio::test]
async fn tied_candidates_resolve_to_the_same_row_every_time() {
    let (bytes, hash) = torrent("movie");
    let h = Harness::new(FakeSearchIndex::with(vec![
        candidate(TITLE, "ExampleTracker", Some(&hash), URL),
        candidate(TITLE, "ExampleTracker", Some(&hash), "http://prowlarr.test/dl/2"),
    ]))
    .await;
    h.artifacts.serve(URL, bytes.clone());
    h.artifacts.serve("http://prowlarr.test/dl/2", bytes);

    for _ in 0..3 {
        let result = h.ingestor.handle_webhook_grab(&webhook(&hash), &settings()).await;
        assert_eq!(result.download_url.as_deref(), Some(URL));
    }
    let grab = h.store.find_grab("radarr", &hash).await.unwrap().unwrap();
    assert_eq!(grab.source_url, URL);
    assert_eq!(h.store.count_grabs().await.unwrap(), 1);
}

#[tokio::test]
async fn weak_candidate_is_rejected_without_writing() {
    let (bytes, hash) = torrent("movie");
    // Substring title plus indexer: 1 + 1.
    let h = Harness::new(FakeSearchIndex::with(vec![candidate(
        "Movie.2024.1080p.REPACK",
        "ExampleTracker",
        None,
        URL,
    )]))
    .await;
    h.artifacts.serve(URL, bytes);

    let result = h.ingestor.handle_webhook_grab(&webhook(&hash), &settings()).await;
    assert_eq!(result.status, IngestStatus::Error);
    assert_eq!(result.kind, Some(ErrorKind::ScoreBelowThreshold));
    assert_eq!(result.reason.as_deref(), Some("score too low"));
    assert_eq!(result.score, Some(2));
    assert_eq!(h.store.count_grabs().await.unwrap(), 0);
    assert_eq!(h.artifacts.fetches.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn weak_candidate_in_minimal_mode_keeps_a_missing_row() {
    let (_, hash) = torrent("movie");
    let h = Harness::new(FakeSearchIndex::with(vec![candidate(
        "Movie.2024.1080p.REPACK",
        "ExampleTracker",
        None,
        URL,
    )]))
    .await;

    let event = GrabEvent {
        instance: "radarr".into(),
        source: IngestSource::HistorySync,
        title: TITLE.into(),
        download_id: Some(hash.clone()),
        indexer: Some("ExampleTracker".into()),
        size: Some(1_500_000_000),
        info_url: Some("https://x/y".into()),
        grabbed_at: None,
    };
    let options = IngestOptions {
        allow_missing_candidate: true,
        ..IngestOptions::default()
    };
    let result = h.ingestor.ingest_grab_event(&event, &options).await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(result.mode, Some(IngestMode::Minimal));

    let grab = h.store.find_grab("radarr", &hash).await.unwrap().unwrap();
    assert_eq!(grab.status, GrabStatus::Missing);
    assert_eq!(grab.artifact_path, None);
    assert_eq!(grab.source_url, "https://x/y");
}

#[tokio::test]
async fn strict_hash_mismatch_discards_the_artifact() {
    let (bytes, _) = torrent("some-other-release");
    let expected = "ABCDEF0123456789ABCDEF0123456789ABCD1234";
    let h = Harness::new(FakeSearchIndex::with(vec![candidate(
        TITLE,
        "ExampleTracker",
        Some(expected),
        URL,
    )]))
    .await;
    h.artifacts.serve(URL, bytes);

    let result = h.ingestor.handle_webhook_grab(&webhook(expected), &settings()).await;
    assert_eq!(result.kind, Some(ErrorKind::HashMismatch));
    assert_eq!(result.reason.as_deref(), Some("hash mismatch"));
    let check = result.hash_check.unwrap();
    assert!(!check.matched);
    assert_eq!(check.expected, expected);
    assert!(!h.artifact_path("Movie.2024.1080p.torrent").exists());
    assert_eq!(h.store.count_grabs().await.unwrap(), 0);
}

#[tokio::test]
async fn lenient_hash_mismatch_still_stores_the_grab() {
    let (bytes, _) = torrent("some-other-release");
    let expected = "ABCDEF0123456789ABCDEF0123456789ABCD1234";
    let h = Harness::new(FakeSearchIndex::with(vec![candidate(
        TITLE,
        "ExampleTracker",
        Some(expected),
        URL,
    )]))
    .await;
    h.artifacts.serve(URL, bytes);

    let lenient = WebhookSettings {
        strict: false,
        ..settings()
    };
    let result = h.ingestor.handle_webhook_grab(&webhook(expected), &lenient).await;
    assert!(result.is_ok(), "{result:?}");
    assert!(!result.hash_check.unwrap().matched);
    let grab = h.store.find_grab("radarr", expected).await.unwrap().unwrap();
    assert_eq!(grab.status, GrabStatus::Downloaded);
}

#[tokio::test]
async fn non_grab_and_untitled_webhooks_are_not_ingested() {
    let h = Harness::new(FakeSearchIndex::default()).await;

    let mut payload = webhook("ABCDEF0123456789ABCDEF0123456789ABCD1234");
    payload.event_type = Some("Download".into());
    let ignored = h.ingestor.handle_webhook_grab(&payload, &settings()).await;
    assert_eq!(ignored.status, IngestStatus::Ignored);
    assert_eq!(ignored.reason.as_deref(), Some("eventType"));
    assert_eq!(ignored.event_type.as_deref(), Some("Download"));

    let untitled: WebhookPayload = serde_json::from_value(json!({ "eventType": "Grab" })).unwrap();
    let missing = h.ingestor.handle_webhook_grab(&untitled, &settings()).await;
    assert_eq!(missing.kind, Some(ErrorKind::MissingTitle));
    assert_eq!(missing.reason.as_deref(), Some("missing releaseTitle"));
    assert_eq!(h.search.searches.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn candidate_without_download_handle_is_an_error() {
    let (_, hash) = torrent("movie");
    let mut c = candidate(TITLE, "ExampleTracker", Some(&hash), URL);
    c.download_url = None;
    let h = Harness::new(FakeSearchIndex::with(vec![c])).await;

    let result = h.ingestor.handle_webhook_grab(&webhook(&hash), &settings()).await;
    assert_eq!(result.kind, Some(ErrorKind::MissingDownloadHandle));
    assert_eq!(result.reason.as_deref(), Some("missing downloadUrl"));
}

#[tokio::test]
async fn recovery_falls_back_to_a_direct_indexer_download() {
    let (bytes, hash) = torrent("movie");
    let h = Harness::new(FakeSearchIndex::with(Vec::new())).await;
    let handle = format!(
        "fake://indexer/7/download?link=https://x/y&file={TITLE}.torrent"
    );
    h.artifacts.serve(&handle, bytes);

    h.store
        .upsert_history(&[grb_core::NewHistoryEntry {
            instance: "radarr".into(),
            raw_id: Some(10),
            event_type: Some("grabbed".into()),
            download_id: Some(hash.clone()),
            source_title: Some(TITLE.into()),
            indexer: Some("ExampleTracker (Prowlarr)".into()),
            size: Some(1_500_000_000),
            info_url: Some("https://x/y".into()),
            grabbed_at: Some(common::base_time()),
        }])
        .await
        .unwrap();
    let entry = h.store.get_history_record(&hash, None).await.unwrap().unwrap();

    let result = h.ingestor.recover_from_history(&entry, 3, true, true).await;
    assert!(result.is_ok(), "{result:?}");
    assert!(result.fallback_used);
    assert!(result.hash_check.unwrap().matched);

    let grab = h.store.find_grab("radarr", &hash).await.unwrap().unwrap();
    assert_eq!(grab.first_seen_source, "history_manual");
    assert_eq!(grab.indexer_id, Some(7));
    assert_eq!(grab.status, GrabStatus::Downloaded);
    assert_eq!(h.ingestor.indexer_cache().stats().count, 1);
}
