use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Article, ArticleDbRow, ArticleQuery, ArticleRecord, StorageError};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: u32 = 2000;

const ARTICLE_COLUMNS: &str = "a.id, a.url, a.source_id, a.title, a.category, a.summary, \
     a.published, a.first_seen, a.last_updated, a.fingerprint";

impl Database {
    // ========================================================================
    // Article Operations
    // ========================================================================

    /// Look up an article by its canonical URL
    pub async fn find_article(&self, url: &str) -> Result<Option<Article>, StorageError> {
        let row: Option<ArticleDbRow> = sqlx::query_as(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a WHERE a.url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ArticleDbRow::into_article))
    }

    /// Insert a new article, stamping `first_seen` and `last_updated` with `now`.
    ///
    /// Uses `ON CONFLICT(url) DO NOTHING`: if another writer inserted the same
    /// URL since the caller's read, nothing is written and `StorageError::Conflict`
    /// is returned so the caller can re-read and decide again.
    pub async fn insert_article(
        &self,
        record: &ArticleRecord,
        now: i64,
    ) -> Result<i64, StorageError> {
        let published = record.published.unwrap_or(now);

        let result = sqlx::query(
            r#"
            INSERT INTO articles
                (url, source_id, title, category, summary, published, first_seen, last_updated, fingerprint)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
        "#,
        )
        .bind(&record.url)
        .bind(&record.source_id)
        .bind(&record.title)
        .bind(&record.category)
        .bind(&record.summary)
        .bind(published)
        .bind(now)
        .bind(now)
        .bind(&record.fingerprint)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict {
                key: record.url.clone(),
            });
        }
        Ok(result.last_insert_rowid())
    }

    /// Overwrite the mutable fields of an existing article.
    ///
    /// The write only lands while the stored fingerprint still equals
    /// `expected_fingerprint`; a concurrent change (or deletion) surfaces as
    /// `StorageError::Conflict`. `source_id` and `first_seen` never change.
    /// `last_updated` always advances: to `now`, or one second past the
    /// previous value when `now` is not later.
    pub async fn update_article(
        &self,
        record: &ArticleRecord,
        expected_fingerprint: &str,
        now: i64,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE articles SET
                title = ?,
                category = ?,
                summary = ?,
                published = COALESCE(?, published),
                fingerprint = ?,
                last_updated = CASE WHEN ? > last_updated THEN ? ELSE last_updated + 1 END
            WHERE url = ? AND fingerprint = ?
        "#,
        )
        .bind(&record.title)
        .bind(&record.category)
        .bind(&record.summary)
        .bind(record.published)
        .bind(&record.fingerprint)
        .bind(now)
        .bind(now)
        .bind(&record.url)
        .bind(expected_fingerprint)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict {
                key: record.url.clone(),
            });
        }
        Ok(())
    }

    /// Read articles for a feed, ordered newest first (`published DESC, url ASC`).
    ///
    /// Empty `sources`/`categories` lists mean "no filter". `free_only` keeps
    /// articles with at least one access check that returned 200. The limit is
    /// capped at 2000 rows.
    pub async fn query_articles(&self, query: &ArticleQuery) -> Result<Vec<Article>, StorageError> {
        let limit = query.limit.min(MAX_ARTICLES);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles a WHERE 1 = 1"));

        if !query.sources.is_empty() {
            builder.push(" AND a.source_id IN (");
            let mut separated = builder.separated(", ");
            for source in &query.sources {
                separated.push_bind(source);
            }
            separated.push_unseparated(")");
        }

        if !query.categories.is_empty() {
            builder.push(" AND a.category IN (");
            let mut separated = builder.separated(", ");
            for category in &query.categories {
                separated.push_bind(category);
            }
            separated.push_unseparated(")");
        }

        if query.free_only {
            builder.push(
                " AND EXISTS (SELECT 1 FROM access_checks ac \
                 WHERE ac.article_id = a.id AND ac.status_code = 200)",
            );
        }

        builder.push(" ORDER BY a.published DESC, a.url ASC LIMIT ");
        builder.push_bind(i64::from(limit));

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Total number of stored articles
    pub async fn count_articles(&self) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
