//! Grab ingestion, the canonical store and history ledger, cursor polling and
//! drift reconciliation.

pub mod config;
pub mod ingest;
pub mod matcher;
pub mod poller;
pub mod reconcile;
pub mod scheduler;
pub mod store;

use anyhow::Result;

pub use config::{HistoryApp, HistorySettings, IngestionMode, SyncConfig, WebhookSettings};
pub use ingest::{GrabEvent, IngestOptions, Ingestor};
pub use matcher::{score_candidate, select_candidate, MatchDecision, MatchQuery, ScoredCandidate};
pub use poller::{HistoryPoller, InstancePollSummary, PollState, PollStatus, PollSummary};
pub use reconcile::{build_report, write_report_bundle, ReconciliationReport, ReportBundle};
pub use scheduler::{build_scheduler, start_scheduler, SyncService, SyncStatus};
pub use store::{
    GrabStore, HistoryFilter, HistoryListing, StoreError, SyncLogEntry, SyncLogRecord, UpsertOutcome,
};

pub const CRATE_NAME: &str = "grb-sync";

/// One history sync cycle using configuration from the environment.
pub async fn run_sync_once_from_env(full_scan: bool) -> Result<Option<PollSummary>> {
    let config = SyncConfig::from_env();
    let service = SyncService::from_config(&config).await?;
    Ok(service.run_cycle(full_scan).await)
}
