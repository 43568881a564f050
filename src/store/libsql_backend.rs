//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Several backends (or several
//! processes) may open the same file; writers wait on SQLite's lock through
//! `busy_timeout` instead of failing immediately.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{QueueName, QueueStats, WorkItem, WorkItemId, WorkStatus};
use crate::scheduler::source::{NewSource, Source, SourceId, validate_interval};
use crate::store::migrations;
use crate::store::traits::Database;

/// How long a writer waits for a lock held by another connection.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // PRAGMA answers with a row, so it goes through query() and must be stepped.
        let mut rows = conn
            .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        drop(rows);

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339, so text order is time order.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a Source. Column order matches SOURCE_COLUMNS.
fn row_to_source(row: &libsql::Row) -> Result<Source, libsql::Error> {
    let last_fetch: Option<String> = row.get(7)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;

    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        category: row.get(3)?,
        language: row.get(4)?,
        is_active: row.get::<i64>(5)? != 0,
        fetch_interval_minutes: row.get(6)?,
        last_fetch_time: parse_optional_datetime(&last_fetch),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a WorkItem. Column order matches WORK_COLUMNS.
fn row_to_work_item(row: &libsql::Row) -> Result<WorkItem, libsql::Error> {
    let queue: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    let claimed_by: Option<String> = row.get(5)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;

    Ok(WorkItem {
        id: row.get(0)?,
        queue: QueueName::new(queue),
        payload_ref: row.get(2)?,
        // Unknown strings can only come from manual edits; treat them as pending.
        status: status_str.parse().unwrap_or(WorkStatus::Pending),
        retry_count: row.get::<i64>(4)?.max(0) as u32,
        claimed_by: claimed_by.and_then(|s| Uuid::parse_str(&s).ok()),
        last_error: row.get(6)?,
        result: row.get(7)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn create_source_err(e: libsql::Error, name: &str) -> DatabaseError {
    if e.to_string().contains("UNIQUE") {
        DatabaseError::Constraint(format!("source {name} already exists"))
    } else {
        DatabaseError::Query(format!("create_source: {e}"))
    }
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

// ── Trait implementation ────────────────────────────────────────────

const SOURCE_COLUMNS: &str = "id, name, url, category, language, is_active, fetch_interval_minutes, last_fetch_time, created_at, updated_at";

const WORK_COLUMNS: &str = "id, queue, payload_ref, status, retry_count, claimed_by, last_error, result, created_at, updated_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Sources ─────────────────────────────────────────────────────

    async fn create_source(&self, source: &NewSource) -> Result<Source, DatabaseError> {
        validate_interval(source.fetch_interval_minutes).map_err(DatabaseError::Constraint)?;
        let now = fmt_datetime(Utc::now());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO sources (name, url, category, language, is_active, fetch_interval_minutes, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) RETURNING {SOURCE_COLUMNS}"
                ),
                params![
                    source.name.as_str(),
                    source.url.as_str(),
                    opt_text(source.category.as_deref()),
                    source.language.as_str(),
                    source.is_active as i64,
                    source.fetch_interval_minutes,
                    now,
                ],
            )
            .await
            .map_err(|e| create_source_err(e, &source.name))?;

        // RETURNING rows are produced on the first step, where a UNIQUE
        // violation may surface as well.
        let row = rows
            .next()
            .await
            .map_err(|e| create_source_err(e, &source.name))?
            .ok_or_else(|| DatabaseError::Query("create_source: no row returned".into()))?;
        let created = row_to_source(&row).map_err(query_err("create_source row parse"))?;

        debug!(source_id = created.id, name = %created.name, "Source created");
        Ok(created)
    }

    async fn get_source(&self, id: SourceId) -> Result<Option<Source>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_source"))?;

        match rows.next().await.map_err(query_err("get_source"))? {
            Some(row) => Ok(Some(
                row_to_source(&row).map_err(query_err("get_source row parse"))?,
            )),
            None => Ok(None),
        }
    }

    async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id"), ())
            .await
            .map_err(query_err("list_sources"))?;

        let mut sources = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_sources"))? {
            sources.push(row_to_source(&row).map_err(query_err("list_sources row parse"))?);
        }
        Ok(sources)
    }

    async fn list_active_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE is_active = 1 ORDER BY id"),
                (),
            )
            .await
            .map_err(query_err("list_active_sources"))?;

        let mut sources = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_active_sources"))? {
            match row_to_source(&row) {
                Ok(source) => sources.push(source),
                Err(e) => tracing::warn!("Skipping source row: {e}"),
            }
        }
        Ok(sources)
    }

    async fn set_source_active(&self, id: SourceId, active: bool) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sources SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active as i64, fmt_datetime(Utc::now()), id],
            )
            .await
            .map_err(query_err("set_source_active"))?;

        debug!(source_id = id, active, "Source active flag updated");
        Ok(changed > 0)
    }

    async fn set_last_fetch_time(
        &self,
        id: SourceId,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sources SET last_fetch_time = ?1, updated_at = ?2 WHERE id = ?3",
                params![fmt_datetime(at), fmt_datetime(Utc::now()), id],
            )
            .await
            .map_err(query_err("set_last_fetch_time"))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "source".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Work items ──────────────────────────────────────────────────

    async fn enqueue_work(
        &self,
        queue: &QueueName,
        payload_ref: &str,
    ) -> Result<WorkItem, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO work_items (queue, payload_ref, status, retry_count, created_at, updated_at) VALUES (?1, ?2, 'pending', 0, ?3, ?3) RETURNING {WORK_COLUMNS}"
                ),
                params![queue.as_str(), payload_ref, now],
            )
            .await
            .map_err(query_err("enqueue_work"))?;

        let row = rows
            .next()
            .await
            .map_err(query_err("enqueue_work"))?
            .ok_or_else(|| DatabaseError::Query("enqueue_work: no row returned".into()))?;
        let item = row_to_work_item(&row).map_err(query_err("enqueue_work row parse"))?;

        debug!(item_id = item.id, queue = %queue, payload = %payload_ref, "Work item enqueued");
        Ok(item)
    }

    async fn claim_next_work(
        &self,
        queue: &QueueName,
        worker: Uuid,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<WorkItem>, DatabaseError> {
        // One statement: the write lock is taken before the inner SELECT runs,
        // so concurrent claimers (any connection, any process) serialize here.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE work_items SET status = 'processing', claimed_by = ?1, updated_at = ?2
                     WHERE id = (
                         SELECT id FROM work_items
                         WHERE queue = ?3
                           AND (status = 'pending'
                                OR (?4 IS NOT NULL AND status = 'processing' AND updated_at < ?4))
                         ORDER BY created_at ASC, id ASC
                         LIMIT 1
                     )
                     RETURNING {WORK_COLUMNS}"
                ),
                params![
                    worker.to_string(),
                    fmt_datetime(Utc::now()),
                    queue.as_str(),
                    opt_text(stale_before.map(fmt_datetime).as_deref()),
                ],
            )
            .await
            .map_err(query_err("claim_next_work"))?;

        let claimed = match rows.next().await.map_err(query_err("claim_next_work"))? {
            Some(row) => Some(row_to_work_item(&row).map_err(query_err("claim_next_work row parse"))?),
            None => None,
        };
        drop(rows);

        if let Some(ref item) = claimed {
            debug!(item_id = item.id, queue = %queue, worker = %worker, "Work item claimed");
        }
        Ok(claimed)
    }

    async fn record_work_failure(
        &self,
        id: WorkItemId,
        error: Option<&str>,
    ) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE work_items SET retry_count = retry_count + 1, last_error = COALESCE(?2, last_error), updated_at = ?3
                 WHERE id = ?1 AND status = 'processing'
                 RETURNING retry_count",
                params![id, opt_text(error), fmt_datetime(Utc::now())],
            )
            .await
            .map_err(query_err("record_work_failure"))?;

        if let Some(row) = rows.next().await.map_err(query_err("record_work_failure"))? {
            let count: i64 = row.get(0).map_err(query_err("record_work_failure row parse"))?;
            return Ok(count.max(0) as u32);
        }
        drop(rows);

        // Not processing: report the unchanged count, or 0 if the item is gone.
        Ok(self
            .get_work_item(id)
            .await?
            .map(|item| item.retry_count)
            .unwrap_or(0))
    }

    async fn mark_work_failed(
        &self,
        id: WorkItemId,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE work_items SET status = 'failed', last_error = COALESCE(?2, last_error), updated_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'processing')",
                params![id, opt_text(reason), fmt_datetime(Utc::now())],
            )
            .await
            .map_err(query_err("mark_work_failed"))?;
        Ok(changed > 0)
    }

    async fn mark_work_completed(
        &self,
        id: WorkItemId,
        result: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE work_items SET status = 'completed', result = ?2, updated_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'processing')",
                params![id, opt_text(result), fmt_datetime(Utc::now())],
            )
            .await
            .map_err(query_err("mark_work_completed"))?;
        Ok(changed > 0)
    }

    async fn get_work_item(&self, id: WorkItemId) -> Result<Option<WorkItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORK_COLUMNS} FROM work_items WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_work_item"))?;

        match rows.next().await.map_err(query_err("get_work_item"))? {
            Some(row) => Ok(Some(
                row_to_work_item(&row).map_err(query_err("get_work_item row parse"))?,
            )),
            None => Ok(None),
        }
    }

    async fn has_payload(
        &self,
        queue: &QueueName,
        payload_ref: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM work_items WHERE queue = ?1 AND payload_ref = ?2 LIMIT 1",
                params![queue.as_str(), payload_ref],
            )
            .await
            .map_err(query_err("has_payload"))?;

        Ok(rows.next().await.map_err(query_err("has_payload"))?.is_some())
    }

    async fn work_stats(&self, queue: &QueueName) -> Result<QueueStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM work_items WHERE queue = ?1 GROUP BY status",
                params![queue.as_str()],
            )
            .await
            .map_err(query_err("work_stats"))?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows.next().await.map_err(query_err("work_stats"))? {
            let status: String = row.get(0).map_err(query_err("work_stats row parse"))?;
            let count = row.get::<i64>(1).map_err(query_err("work_stats row parse"))?.max(0) as u64;
            match status.parse::<WorkStatus>() {
                Ok(WorkStatus::Pending) => stats.pending = count,
                Ok(WorkStatus::Processing) => stats.processing = count,
                Ok(WorkStatus::Failed) => stats.failed = count,
                Ok(WorkStatus::Completed) => stats.completed = count,
                Err(e) => tracing::warn!("Ignoring work status row: {e}"),
            }
        }
        Ok(stats)
    }
}
