use super::schema::Database;
use super::types::{from_unix, RunRow, RunStatus, ScrapeRun, SourceCounts, StorageError};

/// Upper bound for `recent_runs`
const MAX_RUNS: u32 = 500;

impl Database {
    // ========================================================================
    // Scrape Run Audit
    // ========================================================================

    /// Open a new run in the `running` state and return its id
    pub async fn begin_run(&self, started_at: i64) -> Result<i64, StorageError> {
        let result = sqlx::query("INSERT INTO scrape_runs (started_at, status) VALUES (?, 'running')")
            .bind(started_at)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Record (or replace) the counters of one source within a run.
    ///
    /// Only accepted while the run is still `running`; a sealed run is immutable
    /// and yields `StorageError::Conflict`.
    pub async fn record_source(&self, run_id: i64, counts: &SourceCounts) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO scrape_run_sources
                (run_id, source_id, fetched, new, updated, skipped, failed, error)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM scrape_runs WHERE id = ? AND status = 'running')
            ON CONFLICT(run_id, source_id) DO UPDATE SET
                fetched = excluded.fetched,
                new = excluded.new,
                updated = excluded.updated,
                skipped = excluded.skipped,
                failed = excluded.failed,
                error = excluded.error
        "#,
        )
        .bind(run_id)
        .bind(&counts.source_id)
        .bind(counts.fetched)
        .bind(counts.new)
        .bind(counts.updated)
        .bind(counts.skipped)
        .bind(counts.failed)
        .bind(&counts.error)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict {
                key: format!("run {run_id}"),
            });
        }
        Ok(())
    }

    /// Move a running run to its final status. Sealing twice is a conflict.
    pub async fn seal_run(
        &self,
        run_id: i64,
        status: RunStatus,
        ended_at: i64,
    ) -> Result<(), StorageError> {
        debug_assert!(status != RunStatus::Running);

        let result = sqlx::query(
            "UPDATE scrape_runs SET status = ?, ended_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict {
                key: format!("run {run_id}"),
            });
        }
        Ok(())
    }

    /// Load one run with its per-source counters
    pub async fn get_run(&self, run_id: i64) -> Result<Option<ScrapeRun>, StorageError> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, started_at, ended_at, status FROM scrape_runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.assemble_run(row).await?)),
            None => Ok(None),
        }
    }

    /// Most recent runs, newest first
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<ScrapeRun>, StorageError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT id, started_at, ended_at, status FROM scrape_runs ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit.min(MAX_RUNS)))
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            runs.push(self.assemble_run(row).await?);
        }
        Ok(runs)
    }

    async fn assemble_run(&self, row: RunRow) -> Result<ScrapeRun, StorageError> {
        let (id, started_at, ended_at, status) = row;

        let sources: Vec<SourceCounts> = sqlx::query_as(
            r#"
            SELECT source_id, fetched, new, updated, skipped, failed, error
            FROM scrape_run_sources
            WHERE run_id = ?
            ORDER BY source_id
        "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        // The CHECK constraint keeps status within the known set
        let status = status.parse().unwrap_or(RunStatus::Failed);

        Ok(ScrapeRun {
            id,
            started_at: from_unix(started_at),
            ended_at: ended_at.map(from_unix),
            status,
            totals: ScrapeRun::totals_of(&sources),
            sources,
        })
    }
}
