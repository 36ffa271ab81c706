//! Scheduled history sync: single-flight cycles, status, sync log and the
//! repeating timer job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use grb_adapters::{ArrHistoryClient, HistorySource};
use grb_core::{Clock, SystemClock};
use grb_storage::HttpFetcher;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::ingest::Ingestor;
use crate::poller::{HistoryPoller, PollState, PollStatus, PollSummary};
use crate::store::{GrabStore, SyncLogEntry};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_running: bool,
}

/// Clears the running flag when the cycle ends, including on panic.
struct RunningGuard(Arc<AtomicBool>);

impl RunningGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncService {
    ingestor: Arc<Ingestor>,
    poller: HistoryPoller,
    sources: Vec<Arc<dyn HistorySource>>,
    running: Arc<AtomicBool>,
    status: Mutex<SyncStatus>,
}

impl SyncService {
    pub fn new(
        ingestor: Arc<Ingestor>,
        poller: HistoryPoller,
        sources: Vec<Arc<dyn HistorySource>>,
    ) -> Self {
        Self {
            ingestor,
            poller,
            sources,
            running: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(SyncStatus::default()),
        }
    }

    /// Open the store and wire every collaborator from one config snapshot.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = GrabStore::connect(&config.database_url, clock)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let ingestor = Arc::new(Ingestor::from_config(config, store, http.clone()));
        let poller = HistoryPoller::new(ingestor.clone(), config.history.clone());
        let sources = history_sources_from_config(config, http);
        Ok(Self::new(ingestor, poller, sources))
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> SyncStatus {
        let mut status = self.status.lock().await.clone();
        status.is_running = self.is_running();
        status
    }

    /// Run one cycle now. Returns `None` when another scheduled cycle holds
    /// the flag.
    pub async fn run_cycle(&self, full_scan: bool) -> Option<PollSummary> {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            info!("history sync already running; skipping");
            return None;
        };
        Some(self.run_guarded(full_scan).await)
    }

    /// Start a cycle in the background unless one is active.
    pub fn trigger(self: &Arc<Self>, full_scan: bool) -> bool {
        let Some(guard) = RunningGuard::acquire(&self.running) else {
            return false;
        };
        let service = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let summary = service.run_guarded(full_scan).await;
            if summary.aborted().next().is_some() {
                error!(run_id = %summary.run_id, "background history sync ended with aborted instances");
            }
        });
        true
    }

    async fn run_guarded(&self, full_scan: bool) -> PollSummary {
        let run_id = Uuid::new_v4().to_string();
        let store = self.ingestor.store();
        info!(run_id = %run_id, full_scan, instances = self.sources.len(), "history sync started");

        let summary = self.poller.run_cycle(&run_id, &self.sources, full_scan).await;

        let aborted: Vec<String> = summary
            .aborted()
            .map(|i| format!("{}: {}", i.instance, abort_reason(&i.state)))
            .collect();
        let (status, failure) = match summary.status {
            PollStatus::Skipped => ("skipped", summary.reason.clone()),
            PollStatus::Ok if aborted.is_empty() => ("ok", None),
            PollStatus::Ok => ("error", Some(aborted.join("; "))),
        };

        let logged = store
            .log_sync(&SyncLogEntry {
                run_id: run_id.clone(),
                status: status.to_string(),
                error: failure.clone(),
                ingested: summary.ingested as i64,
                inserted: summary.inserted as i64,
            })
            .await;
        if let Err(err) = logged {
            warn!(run_id = %run_id, error = %err, "could not record sync log");
        }

        {
            let mut current = self.status.lock().await;
            current.last_sync = Some(store.clock().now());
            current.last_error = if status == "error" { failure } else { None };
        }

        info!(
            run_id = %run_id,
            status,
            inserted = summary.inserted,
            ingested = summary.ingested,
            "history sync finished"
        );
        summary
    }
}

fn abort_reason(state: &PollState) -> &str {
    match state {
        PollState::Aborted { reason } => reason,
        _ => "",
    }
}

/// One history client per enabled instance.
pub fn history_sources_from_config(
    config: &SyncConfig,
    http: Arc<HttpFetcher>,
) -> Vec<Arc<dyn HistorySource>> {
    config
        .enabled_history_apps()
        .map(|app| {
            Arc::new(ArrHistoryClient::new(&app.name, &app.url, &app.api_key, http.clone()))
                as Arc<dyn HistorySource>
        })
        .collect()
}

/// Repeat the sync every `interval`. The returned scheduler is not started.
pub async fn build_scheduler(service: Arc<SyncService>, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
        let service = service.clone();
        Box::pin(async move {
            if !service.trigger(false) {
                info!("scheduled history sync skipped; previous cycle still running");
            }
        })
    })
    .with_context(|| format!("creating history sync job every {}s", interval.as_secs()))?;
    sched.add(job).await.context("adding history sync job")?;
    Ok(sched)
}

/// Build, start and kick off one immediate cycle.
pub async fn start_scheduler(service: Arc<SyncService>, interval: Duration) -> Result<JobScheduler> {
    let sched = build_scheduler(service.clone(), interval).await?;
    sched.start().await.context("starting scheduler")?;
    service.trigger(false);
    info!(interval_secs = interval.as_secs(), "history sync scheduler started");
    Ok(sched)
}
