use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

/// Schema version written by this release
pub const SCHEMA_VERSION: i64 = 1;

// ============================================================================
// Database
// ============================================================================

/// Owned handle to the SQLite store. Cloning is cheap (shared pool).
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the database
    /// (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN), `DatabaseError::UnsupportedVersion`
    /// if the file was written by a newer schema, and `DatabaseError::Migration`
    /// for other migration failures.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release before
        // returning SQLITE_BUSY. Concurrent reconcile workers queue on the write lock.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // WAL lets feed readers see the last committed state while a scrape writes.
        // Shared-cache in-memory databases take table locks that ignore busy_timeout,
        // so they get a single connection instead.
        let max_connections = if in_memory {
            1
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Current schema version recorded in `schema_meta` (0 for a fresh file)
    pub async fn schema_version(&self) -> Result<i64> {
        let exists: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta'",
        )
        .fetch_one(&self.pool)
        .await?;
        if exists.0 == 0 {
            return Ok(0);
        }

        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM schema_meta WHERE key = 'schema_version'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(v,)| v.parse().ok()).unwrap_or(0))
    }

    /// Bring the schema up to [`SCHEMA_VERSION`].
    ///
    /// Each pending step runs inside one transaction together with the version
    /// bump, so a failed migration leaves the previous consistent schema behind.
    /// Re-running on an up-to-date database is a no-op.
    async fn migrate(&self) -> Result<(), DatabaseError> {
        let current = self
            .schema_version()
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        if current > SCHEMA_VERSION {
            return Err(DatabaseError::UnsupportedVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        for version in (current + 1)..=SCHEMA_VERSION {
            let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
            let step = match version {
                1 => migrate_v1(&mut tx).await,
                other => Err(anyhow::anyhow!("no migration defined for version {other}")),
            };
            step.map_err(|e| DatabaseError::Migration(format!("v{version}: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            )
            .bind(version.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            tracing::info!(version = version, "Applied schema migration");
        }

        Ok(())
    }
}

async fn migrate_v1(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    // url is the natural key; the UNIQUE constraint is the final word on duplicates
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            id INTEGER PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            source_id TEXT NOT NULL,
            title TEXT NOT NULL,
            category TEXT,
            summary TEXT,
            published INTEGER NOT NULL,
            first_seen INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            CHECK (last_updated >= first_seen)
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    // Feed ordering: published DESC, url ASC
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published DESC, url ASC)",
    )
    .execute(&mut **tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_source ON articles(source_id)")
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrape_runs (
            id INTEGER PRIMARY KEY,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            status TEXT NOT NULL
                CHECK (status IN ('running', 'success', 'partial', 'failed'))
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scrape_run_sources (
            run_id INTEGER NOT NULL REFERENCES scrape_runs(id) ON DELETE CASCADE,
            source_id TEXT NOT NULL,
            fetched INTEGER NOT NULL DEFAULT 0,
            new INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            PRIMARY KEY (run_id, source_id)
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS access_checks (
            id INTEGER PRIMARY KEY,
            article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
            status_code INTEGER NOT NULL,
            checked_at INTEGER NOT NULL
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_access_checks_article ON access_checks(article_id, status_code)",
    )
    .execute(&mut **tx)
    .await?;

    Ok(())
}
