mod common;

use common::{base_time, FakeSearchIndex, Harness};
use grb_core::{IngestSource, NewGrab, NewHistoryEntry};
use grb_sync::reconcile::{build_report, render_markdown, write_report_bundle};
use grb_sync::GrabStore;

const HASH_A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
const HASH_B: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
const HASH_C: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC";
const HASH_D: &str = "DDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDD";

fn ledger(instance: &str, raw_id: i64, download_id: &str, title: &str, event_type: &str) -> NewHistoryEntry {
    NewHistoryEntry {
        instance: instance.into(),
        raw_id: Some(raw_id),
        event_type: Some(event_type.into()),
        download_id: Some(download_id.into()),
        source_title: Some(title.into()),
        indexer: Some("ExampleTracker".into()),
        size: Some(1),
        info_url: None,
        grabbed_at: Some(base_time()),
    }
}

fn grab(instance: &str, download_id: &str, title: &str) -> NewGrab {
    NewGrab {
        legacy_id: None,
        download_id: Some(download_id.into()),
        instance: instance.into(),
        source: IngestSource::Webhook,
        title: title.into(),
        source_url: "http://idx/dl".into(),
        artifact_path: Some(format!("{title}.torrent")),
        tracker: Some("ExampleTracker".into()),
        indexer_id: None,
        grabbed_at: base_time(),
    }
}

async fn seed_drift(store: &GrabStore) {
    store
        .upsert_history(&[
            ledger("radarr", 1, HASH_A, "Movie.A.2024.1080p", "grabbed"),
            ledger("radarr", 2, HASH_B, "Movie.B.2024.1080p", "grabbed"),
            ledger("radarr", 3, HASH_D, "Movie.D.2024.1080p", "downloadFolderImported"),
        ])
        .await
        .unwrap();
    assert!(store.upsert_grab(&grab("radarr", HASH_A, "Movie.A.2024.720p")).await.is_success());
    assert!(store.upsert_grab(&grab("radarr", HASH_C, "Movie.C.2024.1080p")).await.is_success());
    // Same download id under another instance is a different identity.
    assert!(store.upsert_grab(&grab("sonarr", HASH_B, "Movie.B.2024.1080p")).await.is_success());
}

#[tokio::test]
async fn report_finds_each_drift_category() {
    let h = Harness::new(FakeSearchIndex::default()).await;
    seed_drift(&h.store).await;

    let report = build_report(&h.store, 20).await.unwrap();
    assert!(!report.is_clean());

    assert_eq!(report.missing_in_canonical.len(), 1);
    assert_eq!(report.missing_in_canonical[0].instance, "radarr");
    assert_eq!(report.missing_in_canonical[0].count, 1);
    assert_eq!(report.missing_in_canonical_total, 1);
    assert_eq!(report.samples_missing_in_canonical[0].download_id, HASH_B);

    assert_eq!(report.missing_in_ledger, 2);
    let ledgerless: Vec<_> = report
        .samples_missing_in_ledger
        .iter()
        .map(|s| (s.instance.as_str(), s.download_id.as_str()))
        .collect();
    assert!(ledgerless.contains(&("radarr", HASH_C)));
    assert!(ledgerless.contains(&("sonarr", HASH_B)));

    assert_eq!(report.mismatched_titles.len(), 1);
    let mismatch = &report.mismatched_titles[0];
    assert_eq!(mismatch.download_id, HASH_A);
    assert_eq!(mismatch.canonical_title, "Movie.A.2024.720p");
    assert_eq!(mismatch.ledger_title, "Movie.A.2024.1080p");
    assert!(mismatch.similarity > 0.8 && mismatch.similarity < 1.0);

    let markdown = render_markdown(&report);
    assert!(markdown.contains("- Missing in canonical store: 1"));
    assert!(markdown.contains("Movie.A.2024.720p"));
}

#[tokio::test]
async fn report_is_read_only_and_respects_the_sample_limit() {
    let h = Harness::new(FakeSearchIndex::default()).await;
    seed_drift(&h.store).await;
    let grabs_before = h.store.count_grabs().await.unwrap();

    let report = build_report(&h.store, 1).await.unwrap();
    assert_eq!(report.samples_missing_in_ledger.len(), 1);
    assert_eq!(report.missing_in_ledger, 2);
    assert_eq!(h.store.count_grabs().await.unwrap(), grabs_before);
}

#[tokio::test]
async fn empty_stores_reconcile_clean() {
    let h = Harness::new(FakeSearchIndex::default()).await;
    let report = build_report(&h.store, 20).await.unwrap();
    assert!(report.is_clean());
    assert!(render_markdown(&report).contains("- none"));
}

#[tokio::test]
async fn report_bundle_lists_checksummed_snapshots() {
    let h = Harness::new(FakeSearchIndex::default()).await;
    seed_drift(&h.store).await;
    let report = build_report(&h.store, 20).await.unwrap();
    let reports = tempfile::tempdir().unwrap();

    let bundle = write_report_bundle(&report, reports.path()).await.unwrap();
    assert!(bundle.dir.join("reconciliation.md").exists());
    assert!(bundle.dir.join("reconciliation.json").exists());
    assert!(bundle.dir.join("snapshots/title_mismatches.parquet").exists());
    assert!(bundle.dir.join("snapshots/missing_in_canonical.parquet").exists());

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&bundle.manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["run_id"], bundle.run_id.as_str());
    let files = manifest["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    for file in files {
        assert_eq!(file["sha256"].as_str().unwrap().len(), 64);
        assert!(file["bytes"].as_u64().unwrap() > 0);
        assert!(bundle.dir.join(file["path"].as_str().unwrap()).exists());
    }

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(bundle.dir.join("reconciliation.json")).unwrap()).unwrap();
    assert_eq!(json["report"]["missing_in_ledger"], 2);
}
