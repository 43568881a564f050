//! Schema versions for the libSQL store.
//!
//! Scheduler and worker processes may open the same file at the same time,
//! so each step runs in its own `BEGIN IMMEDIATE` transaction together with
//! its `_migrations` record, and re-reads the version once it holds the
//! write lock. Whichever process gets there first applies the step; the
//! others see it done and move on.

use chrono::{SecondsFormat, Utc};
use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "sources",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL UNIQUE,
                category TEXT,
                language TEXT NOT NULL DEFAULT 'tr',
                is_active INTEGER NOT NULL DEFAULT 1,
                fetch_interval_minutes INTEGER NOT NULL DEFAULT 60,
                last_fetch_time TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sources_active ON sources(is_active);
        "#,
    },
    Migration {
        version: 2,
        name: "work_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS work_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload_ref TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                last_error TEXT,
                result TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_work_items_claim
                ON work_items(queue, status, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_work_items_payload
                ON work_items(queue, payload_ref);
        "#,
    },
];

/// Bring the schema up to the latest version. Safe to call from several
/// processes at once.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("_migrations table: {e}")))?;

    let seen = current_version(conn).await?;
    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > seen) {
        if apply(conn, migration).await? {
            applied += 1;
        }
    }

    let version = current_version(conn).await?;
    if applied > 0 {
        info!(version, applied, "Schema migrated");
    } else {
        debug!(version, "Schema up to date");
    }
    Ok(())
}

fn step_err(migration: &Migration, stage: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Migration(format!("V{} {} ({stage}): {e}", migration.version, migration.name))
}

/// Apply one step under the write lock. Returns false if another
/// connection applied it first.
async fn apply(conn: &Connection, migration: &Migration) -> Result<bool, DatabaseError> {
    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .map_err(|e| step_err(migration, "lock", e))?;

    let outcome: Result<bool, DatabaseError> = async {
        if current_version(conn).await? >= migration.version {
            return Ok(false);
        }
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| step_err(migration, "schema", e))?;
        conn.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                migration.version,
                migration.name,
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
            ],
        )
        .await
        .map_err(|e| step_err(migration, "record", e))?;
        Ok(true)
    }
    .await;

    match outcome {
        Ok(applied) => {
            conn.execute("COMMIT", ())
                .await
                .map_err(|e| step_err(migration, "commit", e))?;
            if applied {
                info!(version = migration.version, name = migration.name, "Applied migration");
            }
            Ok(applied)
        }
        Err(e) => {
            // The step error is what matters; a failed rollback leaves the
            // connection in the same state.
            let _ = conn.execute("ROLLBACK", ()).await;
            Err(e)
        }
    }
}

/// Highest recorded version, 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    fn latest() -> i64 {
        MIGRATIONS.last().map_or(0, |m| m.version)
    }

    async fn memory_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    #[tokio::test]
    async fn fresh_database_gets_every_table() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in ["sources", "work_items", "_migrations"] {
            let n = count(
                &conn,
                &format!("SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='{table}'"),
            )
            .await;
            assert_eq!(n, 1, "table {table} missing");
        }
        assert_eq!(current_version(&conn).await.unwrap(), latest());
    }

    #[tokio::test]
    async fn rerun_applies_nothing() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(current_version(&conn).await.unwrap(), latest());
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM _migrations").await,
            MIGRATIONS.len() as i64
        );
    }

    #[tokio::test]
    async fn already_applied_step_is_skipped_under_lock() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        // Another process got there between our version read and the lock.
        assert!(!apply(&conn, &MIGRATIONS[0]).await.unwrap());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM _migrations WHERE version = 1").await, 1);

        // The transaction was closed, so a new one can start.
        conn.execute("BEGIN", ()).await.unwrap();
        conn.execute("ROLLBACK", ()).await.unwrap();
    }

    #[tokio::test]
    async fn failed_step_leaves_no_record() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        let broken = Migration {
            version: latest() + 1,
            name: "broken",
            sql: "CREATE TABLE later (id INTEGER); CREATE TABLE sources (id INTEGER);",
        };
        let err = apply(&conn, &broken).await.unwrap_err();
        assert!(err.to_string().contains("broken"), "{err}");

        assert_eq!(current_version(&conn).await.unwrap(), latest());
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'later'").await,
            0
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_openers_migrate_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");

        let openers: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                tokio::spawn(async move { LibSqlBackend::new_local(&path).await.map(|_| ()) })
            })
            .collect();
        for opener in openers {
            opener.await.unwrap().unwrap();
        }

        let conn = libsql::Builder::new_local(&path)
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap();
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM _migrations").await,
            MIGRATIONS.len() as i64
        );
        assert_eq!(current_version(&conn).await.unwrap(), latest());
    }
}
