//! Cursor-driven polling of download-manager history into the ledger and the
//! canonical store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use grb_adapters::{HistoryRecord, HistorySource};
use grb_core::{normalize_download_id, HistoryCursor, IngestSource};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{HistorySettings, IngestionMode};
use crate::ingest::{GrabEvent, IngestOptions, Ingestor};

/// Per-instance poll lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Paginating { page: u32 },
    Completed,
    Aborted { reason: String },
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstancePollSummary {
    pub instance: String,
    pub state: PollState,
    pub pages: u32,
    pub records_total: usize,
    pub records_grabbed: usize,
    pub records_filtered_old: usize,
    pub inserted: usize,
    pub updated: usize,
    pub ingested: usize,
    pub ingest_failures: usize,
    pub full_scan: bool,
    pub cursor_before: Option<String>,
    pub cursor_after: Option<String>,
    pub cursor_saved: bool,
}

impl InstancePollSummary {
    fn new(instance: &str, full_scan: bool) -> Self {
        Self {
            instance: instance.to_string(),
            state: PollState::Idle,
            pages: 0,
            records_total: 0,
            records_grabbed: 0,
            records_filtered_old: 0,
            inserted: 0,
            updated: 0,
            ingested: 0,
            ingest_failures: 0,
            full_scan,
            cursor_before: None,
            cursor_after: None,
            cursor_saved: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Ok,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollSummary {
    pub run_id: String,
    pub status: PollStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub instances: Vec<InstancePollSummary>,
    pub inserted: usize,
    pub ingested: usize,
}

impl PollSummary {
    fn skipped(run_id: &str, reason: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: PollStatus::Skipped,
            reason: Some(reason.to_string()),
            instances: Vec::new(),
            inserted: 0,
            ingested: 0,
        }
    }

    /// Instances whose poll ended before pagination finished.
    pub fn aborted(&self) -> impl Iterator<Item = &InstancePollSummary> {
        self.instances
            .iter()
            .filter(|i| matches!(i.state, PollState::Aborted { .. }))
    }
}

pub struct HistoryPoller {
    ingestor: Arc<Ingestor>,
    settings: HistorySettings,
}

impl HistoryPoller {
    pub fn new(ingestor: Arc<Ingestor>, settings: HistorySettings) -> Self {
        Self { ingestor, settings }
    }

    pub async fn run_cycle(
        &self,
        run_id: &str,
        sources: &[Arc<dyn HistorySource>],
        full_scan: bool,
    ) -> PollSummary {
        if sources.is_empty() {
            return PollSummary::skipped(run_id, "no_apps");
        }
        if self.settings.ingestion_mode == IngestionMode::WebhookOnly {
            return PollSummary::skipped(run_id, "ingestion_mode_webhook_only");
        }

        let mut summary = PollSummary {
            run_id: run_id.to_string(),
            status: PollStatus::Ok,
            reason: None,
            instances: Vec::with_capacity(sources.len()),
            inserted: 0,
            ingested: 0,
        };
        for source in sources {
            let span = info_span!("history_sync", run_id, instance = source.instance());
            let instance = self
                .poll_instance(source.as_ref(), full_scan)
                .instrument(span)
                .await;
            summary.inserted += instance.inserted;
            summary.ingested += instance.ingested;
            summary.instances.push(instance);
        }
        summary
    }

    /// `Idle -> Paginating -> (Completed | Aborted)`. The cursor is persisted
    /// at the end either way, and only if it moved forward.
    pub async fn poll_instance(&self, source: &dyn HistorySource, full_scan: bool) -> InstancePollSummary {
        let instance = source.instance().to_string();
        let store = self.ingestor.store();
        let mut summary = InstancePollSummary::new(&instance, full_scan);

        let cursor = match store.load_cursor(&instance).await {
            Ok(cursor) => cursor,
            Err(err) => {
                warn!(error = %err, "could not load history cursor");
                summary.state = PollState::Aborted {
                    reason: err.to_string(),
                };
                return summary;
            }
        };
        summary.cursor_before = cursor.encode();
        let mut highest: HistoryCursor = cursor;

        let lookback_start =
            store.clock().now() - ChronoDuration::days(self.settings.lookback_days.max(1));
        let options = IngestOptions::for_history_sync(&self.settings);
        let mut seen_download_ids: HashSet<String> = HashSet::new();

        for page in 1..=self.settings.max_pages {
            summary.state = PollState::Paginating { page };
            let records = match source.history_page(page, self.settings.page_size).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(page, error = %err, "history page fetch failed");
                    summary.state = PollState::Aborted {
                        reason: err.to_string(),
                    };
                    break;
                }
            };
            summary.pages = page;
            summary.records_total += records.len();
            if records.is_empty() {
                break;
            }

            let mut reached_lookback = false;
            let mut admitted: Vec<&HistoryRecord> = Vec::new();
            for record in &records {
                let is_wanted_event = record
                    .event_type
                    .as_deref()
                    .is_some_and(|t| t.eq_ignore_ascii_case(&self.settings.event_type));
                if !is_wanted_event {
                    continue;
                }
                // Newest-first ordering: everything after this is older still.
                if record.date.is_some_and(|ts| ts < lookback_start) {
                    summary.records_filtered_old += 1;
                    reached_lookback = true;
                    continue;
                }
                if !full_scan && !cursor.admits(record.date, record.id) {
                    continue;
                }
                admitted.push(record);
            }
            summary.records_grabbed += admitted.len();

            let ledger: Vec<_> = admitted
                .iter()
                .map(|record| record.to_ledger_entry(&instance))
                .collect();
            match store.upsert_history(&ledger).await {
                Ok(written) => {
                    summary.inserted += written.inserted;
                    summary.updated += written.updated;
                }
                Err(err) => {
                    warn!(page, error = %err, "history ledger write failed");
                    summary.state = PollState::Aborted {
                        reason: err.to_string(),
                    };
                    break;
                }
            }

            for record in admitted {
                highest.observe(record.date, record.id);
                let Some(download_id) = record.download_id.as_deref().and_then(normalize_download_id)
                else {
                    continue;
                };
                if !seen_download_ids.insert(download_id.clone()) {
                    continue;
                }
                let event = GrabEvent {
                    instance: instance.clone(),
                    source: IngestSource::HistorySync,
                    title: record
                        .source_title
                        .clone()
                        .unwrap_or_else(|| download_id.clone()),
                    download_id: Some(download_id),
                    indexer: record.indexer.clone(),
                    size: record.size,
                    info_url: record.info_url.clone(),
                    grabbed_at: record.date,
                };
                let result = self.ingestor.ingest_grab_event(&event, &options).await;
                if result.is_ok() {
                    summary.ingested += 1;
                } else {
                    summary.ingest_failures += 1;
                    debug!(reason = ?result.reason, "history record not ingested");
                }
            }

            if records.len() < self.settings.page_size as usize || reached_lookback {
                break;
            }
        }
        if !summary.state.is_terminal() {
            summary.state = PollState::Completed;
        }

        match store.save_cursor_if_greater(&instance, &highest).await {
            Ok(saved) => summary.cursor_saved = saved,
            Err(err) => warn!(error = %err, "could not persist history cursor"),
        }
        summary.cursor_after = store
            .load_cursor(&instance)
            .await
            .ok()
            .and_then(|c| c.encode());

        info!(
            pages = summary.pages,
            grabbed = summary.records_grabbed,
            filtered_old = summary.records_filtered_old,
            inserted = summary.inserted,
            ingested = summary.ingested,
            state = ?summary.state,
            "history poll finished"
        );
        summary
    }
}
