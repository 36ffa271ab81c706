//! SQLite persistence for the canonical grab set, the history ledger, cursors
//! and sync logs.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use grb_core::{
    abbreviate_download_id, format_timestamp, normalize_download_id, normalize_instance,
    parse_timestamp, Clock, ErrorKind, Grab, GrabStatus, HistoryCursor, HistoryEntry,
    NewGrab, NewHistoryEntry,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const UPSERT_ATTEMPTS: usize = 5;
const UPSERT_BACKOFF_STEP: Duration = Duration::from_millis(150);
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

pub const DEFAULT_HISTORY_LIMIT: i64 = 200;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("database locked (retries exhausted after {attempts} attempts)")]
    ContentionExhausted { attempts: usize },
    #[error("corrupt {table} row {id}: {message}")]
    CorruptRow {
        table: &'static str,
        id: i64,
        message: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Migration(_) => ErrorKind::SchemaMigrationError,
            Self::ContentionExhausted { .. } => ErrorKind::TransientStoreContention,
            _ => ErrorKind::Store,
        }
    }
}

/// Result of one canonical upsert. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted { id: i64 },
    Updated { id: i64 },
    Duplicate,
    Failed { kind: ErrorKind, message: String },
}

impl UpsertOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Inserted { .. } | Self::Updated { .. })
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Self::Inserted { id } | Self::Updated { id } => Some(*id),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Inserted { .. } => "inserted".to_string(),
            Self::Updated { .. } => "updated (idempotent)".to_string(),
            Self::Duplicate => "duplicate legacy id".to_string(),
            Self::Failed { message, .. } => message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryUpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone)]
pub struct HistoryFilter {
    pub limit: i64,
    pub instance: Option<String>,
    pub tracker: Option<String>,
    pub download_id: Option<String>,
    pub status: Option<GrabStatus>,
    pub source: Option<String>,
    /// Only the newest ledger row per canonical identity.
    pub dedup: bool,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
            instance: None,
            tracker: None,
            download_id: None,
            status: None,
            source: None,
            dedup: true,
        }
    }
}

/// Ledger row joined with its canonical counterpart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryListing {
    pub entry: HistoryEntry,
    pub artifact_path: Option<String>,
    pub status: GrabStatus,
    pub source: String,
    pub source_last_seen: String,
    pub in_canonical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLogEntry {
    pub run_id: String,
    pub status: String,
    pub error: Option<String>,
    pub ingested: i64,
    pub inserted: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncLogRecord {
    pub id: i64,
    pub sync_at: DateTime<Utc>,
    pub entry: SyncLogEntry,
}

#[derive(Debug, FromRow)]
struct GrabRow {
    id: i64,
    legacy_id: Option<i64>,
    download_id: Option<String>,
    instance: String,
    title: String,
    source_url: String,
    artifact_path: Option<String>,
    tracker: Option<String>,
    indexer_id: Option<i64>,
    status: String,
    first_seen_source: String,
    last_seen_source: String,
    grabbed_at: String,
    created_at: String,
    updated_at: String,
    last_error: Option<String>,
}

impl TryFrom<GrabRow> for Grab {
    type Error = StoreError;

    fn try_from(row: GrabRow) -> Result<Self, Self::Error> {
        let ts = |value: &str| {
            parse_timestamp(value).ok_or_else(|| StoreError::CorruptRow {
                table: "grabs",
                id: row.id,
                message: format!("bad timestamp {value:?}"),
            })
        };
        let status = GrabStatus::parse(&row.status).ok_or_else(|| StoreError::CorruptRow {
            table: "grabs",
            id: row.id,
            message: format!("bad status {:?}", row.status),
        })?;
        Ok(Grab {
            grabbed_at: ts(&row.grabbed_at)?,
            created_at: ts(&row.created_at)?,
            updated_at: ts(&row.updated_at)?,
            id: row.id,
            legacy_id: row.legacy_id,
            download_id: row.download_id,
            instance: row.instance,
            title: row.title,
            source_url: row.source_url,
            artifact_path: row.artifact_path,
            tracker: row.tracker,
            indexer_id: row.indexer_id,
            status,
            first_seen_source: row.first_seen_source,
            last_seen_source: row.last_seen_source,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
struct HistoryRow {
    id: i64,
    instance: String,
    raw_id: Option<i64>,
    event_type: Option<String>,
    download_id: Option<String>,
    source_title: Option<String>,
    indexer: Option<String>,
    size: Option<i64>,
    info_url: Option<String>,
    grabbed_at: Option<String>,
}

impl From<HistoryRow> for HistoryEntry {
    fn from(row: HistoryRow) -> Self {
        HistoryEntry {
            id: row.id,
            instance: row.instance,
            raw_id: row.raw_id,
            event_type: row.event_type,
            download_id: row.download_id,
            source_title: row.source_title,
            indexer: row.indexer,
            size: row.size,
            info_url: row.info_url,
            grabbed_at: row.grabbed_at.as_deref().and_then(parse_timestamp),
        }
    }
}

#[derive(Debug, FromRow)]
struct HistoryListingRow {
    #[sqlx(flatten)]
    entry: HistoryRow,
    artifact_path: Option<String>,
    status: String,
    source: String,
    source_last_seen: String,
    in_canonical: i64,
}

#[derive(Debug, FromRow)]
struct SyncLogRow {
    id: i64,
    run_id: String,
    sync_at: String,
    status: String,
    error: Option<String>,
    ingested: i64,
    inserted: i64,
}

impl HistoryRow {
    /// Fold a new sighting of the same ledger key into this row. Identity
    /// columns are only filled; descriptive columns take the newer non-null
    /// value; `grabbed_at` keeps the latest timestamp.
    fn merged(
        &self,
        entry: &NewHistoryEntry,
        raw_id: Option<i64>,
        download_id: Option<&str>,
        grabbed_at: Option<&str>,
    ) -> HistoryRow {
        HistoryRow {
            raw_id: self.raw_id.or(raw_id),
            download_id: self.download_id.clone().or_else(|| download_id.map(str::to_string)),
            event_type: entry.event_type.clone().or_else(|| self.event_type.clone()),
            source_title: entry.source_title.clone().or_else(|| self.source_title.clone()),
            indexer: entry.indexer.clone().or_else(|| self.indexer.clone()),
            size: entry.size.or(self.size),
            info_url: entry.info_url.clone().or_else(|| self.info_url.clone()),
            grabbed_at: self.grabbed_at.clone().max(grabbed_at.map(str::to_string)),
            ..self.clone()
        }
    }
}

const HISTORY_COLUMNS: &str = "hs.id, hs.instance, hs.raw_id, hs.event_type, hs.download_id, \
     hs.source_title, hs.indexer, hs.size, hs.info_url, hs.grabbed_at";

#[derive(Debug, Clone)]
pub struct GrabStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    schema: Arc<OnceCell<()>>,
}

impl GrabStore {
    /// Open (creating if needed) the database and apply the schema.
    pub async fn connect(database_url: &str, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let pool_options = if in_memory {
            // One long-lived connection; the database vanishes with it.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self::from_pool(pool, clock);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", clock).await
    }

    pub fn from_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            schema: Arc::new(OnceCell::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Applies migrations once per store; concurrent callers wait on the first.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema
            .get_or_try_init(|| async move {
                MIGRATOR.run(&self.pool).await?;
                info!("database schema ready");
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }

    /// Insert or merge one canonical grab.
    ///
    /// An existing row with the same `(instance, download_id)` is updated in
    /// place with `first_seen_source` preserved; otherwise a known legacy id
    /// is a duplicate; otherwise a new row is inserted. Busy/locked errors are
    /// retried with linear backoff.
    pub async fn upsert_grab(&self, grab: &NewGrab) -> UpsertOutcome {
        if let Err(err) = self.ensure_schema().await {
            return UpsertOutcome::Failed {
                kind: err.kind(),
                message: err.to_string(),
            };
        }
        match self.retrying(|| self.try_upsert_grab(grab)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    instance = %grab.instance,
                    download_id = %abbreviate_download_id(grab.download_id.as_deref()),
                    error = %err,
                    "canonical upsert failed"
                );
                UpsertOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }
        }
    }

    async fn try_upsert_grab(&self, grab: &NewGrab) -> Result<UpsertOutcome, sqlx::Error> {
        let now = format_timestamp(self.clock.now());
        let instance = instance_or_unknown(&grab.instance);
        let download_id = grab.download_id.as_deref().and_then(normalize_download_id);
        let artifact_path = grab
            .artifact_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let source = grab.source.as_str();
        let grabbed_at = format_timestamp(grab.grabbed_at);

        let mut tx = self.pool.begin().await?;

        if let Some(download_id) = &download_id {
            let existing: Option<(i64, Option<String>)> = sqlx::query_as(
                "SELECT id, artifact_path FROM grabs WHERE instance = ? AND download_id = ? LIMIT 1",
            )
            .bind(&instance)
            .bind(download_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((id, previous_artifact)) = existing {
                let artifact_path = artifact_path.or(previous_artifact.filter(|p| !p.trim().is_empty()));
                let status = GrabStatus::for_artifact(artifact_path.as_deref());
                sqlx::query(
                    "UPDATE grabs SET legacy_id = COALESCE(?, legacy_id), title = ?, source_url = ?, \
                     artifact_path = ?, tracker = ?, indexer_id = ?, status = ?, last_seen_source = ?, \
                     grabbed_at = ?, updated_at = ?, last_error = NULL WHERE id = ?",
                )
                .bind(grab.legacy_id)
                .bind(&grab.title)
                .bind(&grab.source_url)
                .bind(&artifact_path)
                .bind(&grab.tracker)
                .bind(grab.indexer_id)
                .bind(status.as_str())
                .bind(source)
                .bind(&grabbed_at)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                debug!(id, %instance, "canonical grab updated");
                return Ok(UpsertOutcome::Updated { id });
            }
        }

        if let Some(legacy_id) = grab.legacy_id {
            let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM grabs WHERE legacy_id = ?")
                .bind(legacy_id)
                .fetch_one(&mut *tx)
                .await?;
            if known > 0 {
                return Ok(UpsertOutcome::Duplicate);
            }
        }

        let status = GrabStatus::for_artifact(artifact_path.as_deref());
        let result = sqlx::query(
            "INSERT INTO grabs (legacy_id, download_id, instance, title, source_url, artifact_path, \
             tracker, indexer_id, status, first_seen_source, last_seen_source, grabbed_at, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(grab.legacy_id)
        .bind(&download_id)
        .bind(&instance)
        .bind(&grab.title)
        .bind(&grab.source_url)
        .bind(&artifact_path)
        .bind(&grab.tracker)
        .bind(grab.indexer_id)
        .bind(status.as_str())
        .bind(source)
        .bind(source)
        .bind(&grabbed_at)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        let id = result.last_insert_rowid();
        debug!(id, %instance, "canonical grab inserted");
        Ok(UpsertOutcome::Inserted { id })
    }

    /// Write ledger entries. An entry matching an existing row by canonical
    /// identity `(instance, download_id)`, or else by `(instance, raw_id)`,
    /// fills that row in; anything else is inserted. Re-sightings that add
    /// nothing are not counted.
    pub async fn upsert_history(
        &self,
        entries: &[NewHistoryEntry],
    ) -> Result<HistoryUpsertSummary, StoreError> {
        if entries.is_empty() {
            return Ok(HistoryUpsertSummary::default());
        }
        self.ensure_schema().await?;
        self.retrying(|| self.try_upsert_history(entries)).await
    }

    async fn try_upsert_history(
        &self,
        entries: &[NewHistoryEntry],
    ) -> Result<HistoryUpsertSummary, sqlx::Error> {
        let now = format_timestamp(self.clock.now());
        let mut summary = HistoryUpsertSummary::default();
        let mut tx = self.pool.begin().await?;
        let by_identity_sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM grab_history hs WHERE hs.instance = ? AND hs.download_id = ? LIMIT 1"
        );
        let by_raw_id_sql =
            format!("SELECT {HISTORY_COLUMNS} FROM grab_history hs WHERE hs.instance = ? AND hs.raw_id = ? LIMIT 1");

        for entry in entries {
            let instance = instance_or_unknown(&entry.instance);
            let download_id = entry.download_id.as_deref().and_then(normalize_download_id);
            let grabbed_at = entry.grabbed_at.map(format_timestamp);

            let by_identity: Option<HistoryRow> = match &download_id {
                Some(download_id) => {
                    sqlx::query_as(&by_identity_sql)
                        .bind(&instance)
                        .bind(download_id)
                        .fetch_optional(&mut *tx)
                        .await?
                }
                None => None,
            };
            let by_raw_id: Option<HistoryRow> = match entry.raw_id {
                Some(raw_id) => {
                    sqlx::query_as(&by_raw_id_sql)
                        .bind(&instance)
                        .bind(raw_id)
                        .fetch_optional(&mut *tx)
                        .await?
                }
                None => None,
            };

            let Some(existing) = by_identity.as_ref().or(by_raw_id.as_ref()) else {
                sqlx::query(
                    "INSERT INTO grab_history (instance, raw_id, event_type, download_id, \
                     source_title, indexer, size, info_url, grabbed_at, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&instance)
                .bind(entry.raw_id)
                .bind(&entry.event_type)
                .bind(&download_id)
                .bind(&entry.source_title)
                .bind(&entry.indexer)
                .bind(entry.size)
                .bind(&entry.info_url)
                .bind(&grabbed_at)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                summary.inserted += 1;
                continue;
            };

            // Another row already owns this raw id; fill everything else.
            let raw_id_taken = by_raw_id.as_ref().is_some_and(|row| row.id != existing.id);
            if raw_id_taken {
                debug!(
                    %instance,
                    raw_id = ?entry.raw_id,
                    download_id = %abbreviate_download_id(download_id.as_deref()),
                    "raw id belongs to another ledger row; not copied"
                );
            }
            let merged = existing.merged(
                entry,
                entry.raw_id.filter(|_| !raw_id_taken),
                download_id.as_deref(),
                grabbed_at.as_deref(),
            );
            if &merged == existing {
                continue;
            }

            sqlx::query(
                "UPDATE grab_history SET raw_id = ?, event_type = ?, download_id = ?, \
                 source_title = ?, indexer = ?, size = ?, info_url = ?, grabbed_at = ? \
                 WHERE id = ?",
            )
            .bind(merged.raw_id)
            .bind(&merged.event_type)
            .bind(&merged.download_id)
            .bind(&merged.source_title)
            .bind(&merged.indexer)
            .bind(merged.size)
            .bind(&merged.info_url)
            .bind(&merged.grabbed_at)
            .bind(merged.id)
            .execute(&mut *tx)
            .await?;
            summary.updated += 1;
        }

        tx.commit().await?;
        Ok(summary)
    }

    pub async fn list_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryListing>, StoreError> {
        self.ensure_schema().await?;
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(HISTORY_COLUMNS);
        qb.push(
            ", g.artifact_path AS artifact_path, \
             COALESCE(g.status, 'missing') AS status, \
             COALESCE(g.first_seen_source, 'history_sync') AS source, \
             COALESCE(g.last_seen_source, 'history_sync') AS source_last_seen, \
             CASE WHEN g.id IS NULL THEN 0 ELSE 1 END AS in_canonical \
             FROM grab_history hs \
             LEFT JOIN grabs g ON g.instance = hs.instance AND g.download_id = hs.download_id \
             WHERE 1=1",
        );

        if filter.dedup {
            qb.push(
                " AND hs.download_id IS NOT NULL AND trim(hs.download_id) != '' \
                 AND NOT EXISTS (SELECT 1 FROM grab_history newer \
                 WHERE newer.instance = hs.instance AND newer.download_id = hs.download_id \
                 AND (COALESCE(newer.grabbed_at, '') > COALESCE(hs.grabbed_at, '') \
                 OR (COALESCE(newer.grabbed_at, '') = COALESCE(hs.grabbed_at, '') AND newer.id > hs.id)))",
            );
        }
        if let Some(instance) = filter.instance.as_deref().filter(|s| !s.trim().is_empty()) {
            qb.push(" AND hs.instance = ").push_bind(normalize_instance(instance));
        }
        if let Some(tracker) = filter.tracker.as_deref().filter(|s| !s.trim().is_empty()) {
            qb.push(" AND hs.indexer = ").push_bind(tracker.to_string());
        }
        if let Some(download_id) = filter.download_id.as_deref().and_then(normalize_download_id) {
            qb.push(" AND hs.download_id = ").push_bind(download_id);
        }
        if let Some(status) = filter.status {
            qb.push(" AND COALESCE(g.status, 'missing') = ")
                .push_bind(status.as_str());
        }
        if let Some(source) = filter.source.as_deref().filter(|s| !s.trim().is_empty()) {
            qb.push(" AND COALESCE(g.first_seen_source, 'history_sync') = ")
                .push_bind(source.to_string());
        }
        qb.push(" ORDER BY hs.grabbed_at DESC, hs.id DESC LIMIT ")
            .push_bind(filter.limit.max(1));

        let rows: Vec<HistoryListingRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| HistoryListing {
                entry: row.entry.into(),
                artifact_path: row.artifact_path,
                status: GrabStatus::parse(&row.status).unwrap_or(GrabStatus::Missing),
                source: row.source,
                source_last_seen: row.source_last_seen,
                in_canonical: row.in_canonical != 0,
            })
            .collect())
    }

    /// Newest ledger row for a download id, optionally within one instance.
    pub async fn get_history_record(
        &self,
        download_id: &str,
        instance: Option<&str>,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        let Some(download_id) = normalize_download_id(download_id) else {
            return Ok(None);
        };
        self.ensure_schema().await?;
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(HISTORY_COLUMNS);
        qb.push(" FROM grab_history hs WHERE hs.download_id = ")
            .push_bind(download_id);
        if let Some(instance) = instance.filter(|s| !s.trim().is_empty()) {
            qb.push(" AND hs.instance = ").push_bind(normalize_instance(instance));
        }
        qb.push(" ORDER BY hs.grabbed_at DESC, hs.id DESC LIMIT 1");
        let row: Option<HistoryRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_grab(&self, id: i64) -> Result<Option<Grab>, StoreError> {
        self.ensure_schema().await?;
        let row: Option<GrabRow> = sqlx::query_as("SELECT * FROM grabs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Grab::try_from).transpose()
    }

    pub async fn find_grab(
        &self,
        instance: &str,
        download_id: &str,
    ) -> Result<Option<Grab>, StoreError> {
        let Some(download_id) = normalize_download_id(download_id) else {
            return Ok(None);
        };
        self.ensure_schema().await?;
        let row: Option<GrabRow> =
            sqlx::query_as("SELECT * FROM grabs WHERE instance = ? AND download_id = ? LIMIT 1")
                .bind(instance_or_unknown(instance))
                .bind(download_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Grab::try_from).transpose()
    }

    /// Newest first, optionally restricted to one tracker.
    pub async fn list_grabs(&self, limit: i64, tracker: Option<&str>) -> Result<Vec<Grab>, StoreError> {
        self.ensure_schema().await?;
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM grabs WHERE 1=1");
        if let Some(tracker) = tracker.filter(|t| !t.is_empty() && *t != "all") {
            qb.push(" AND tracker = ").push_bind(tracker.to_string());
        }
        qb.push(" ORDER BY grabbed_at DESC, id DESC LIMIT ")
            .push_bind(limit.max(1));
        let rows: Vec<GrabRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Grab::try_from).collect()
    }

    pub async fn count_grabs(&self) -> Result<i64, StoreError> {
        self.ensure_schema().await?;
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM grabs")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_schema().await?;
        Ok(sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn set_config(&self, key: &str, value: &str, description: &str) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        let now = format_timestamp(self.clock.now());
        let now = now.as_str();
        self.retrying(|| async move {
            sqlx::query(
                "INSERT INTO config (key, value, description, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 description = excluded.description, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(description)
            .bind(now)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn load_cursor(&self, instance: &str) -> Result<HistoryCursor, StoreError> {
        let raw = self.get_config(&HistoryCursor::config_key(instance)).await?;
        Ok(raw.as_deref().map(HistoryCursor::decode).unwrap_or_default())
    }

    /// Persist `cursor` only when it is strictly ahead of the stored one.
    pub async fn save_cursor_if_greater(
        &self,
        instance: &str,
        cursor: &HistoryCursor,
    ) -> Result<bool, StoreError> {
        let Some(encoded) = cursor.encode() else {
            return Ok(false);
        };
        let current = self.load_cursor(instance).await?;
        if *cursor <= current {
            return Ok(false);
        }
        self.set_config(
            &HistoryCursor::config_key(instance),
            &encoded,
            "history reconciliation cursor",
        )
        .await?;
        debug!(instance, cursor = %encoded, "history cursor advanced");
        Ok(true)
    }

    pub async fn log_sync(&self, entry: &SyncLogEntry) -> Result<i64, StoreError> {
        self.ensure_schema().await?;
        let now = format_timestamp(self.clock.now());
        let now = now.as_str();
        let result = self
            .retrying(|| async move {
                sqlx::query(
                    "INSERT INTO sync_log (run_id, sync_at, status, error, ingested, inserted) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&entry.run_id)
                .bind(now)
                .bind(&entry.status)
                .bind(&entry.error)
                .bind(entry.ingested)
                .bind(entry.inserted)
                .execute(&self.pool)
                .await
            })
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_sync_logs(&self, limit: i64) -> Result<Vec<SyncLogRecord>, StoreError> {
        self.ensure_schema().await?;
        let rows: Vec<SyncLogRow> =
            sqlx::query_as("SELECT * FROM sync_log ORDER BY sync_at DESC, id DESC LIMIT ?")
                .bind(limit.max(1))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| {
                let sync_at = parse_timestamp(&row.sync_at).ok_or_else(|| StoreError::CorruptRow {
                    table: "sync_log",
                    id: row.id,
                    message: format!("bad timestamp {:?}", row.sync_at),
                })?;
                Ok(SyncLogRecord {
                    id: row.id,
                    sync_at,
                    entry: SyncLogEntry {
                        run_id: row.run_id,
                        status: row.status,
                        error: row.error,
                        ingested: row.ingested,
                        inserted: row.inserted,
                    },
                })
            })
            .collect()
    }

    /// Runs `op` until it succeeds or fails with a non-contention error.
    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        for attempt in 1..=UPSERT_ATTEMPTS {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) => {
                    if attempt == UPSERT_ATTEMPTS {
                        break;
                    }
                    warn!(attempt, attempts = UPSERT_ATTEMPTS, error = %err, "database busy; retrying");
                    tokio::time::sleep(UPSERT_BACKOFF_STEP * attempt as u32).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::ContentionExhausted {
            attempts: UPSERT_ATTEMPTS,
        })
    }
}

fn instance_or_unknown(instance: &str) -> String {
    let normalized = normalize_instance(instance);
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

/// Busy/locked contention, or a unique-key race that the next attempt
/// resolves through the update path.
fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                return true;
            }
            let primary_code = db_err
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(|code| code & 0xff);
            if matches!(primary_code, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
                return true;
            }
            let message = db_err.message().to_ascii_lowercase();
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}
