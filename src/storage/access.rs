use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::StorageError;

impl Database {
    /// Articles from the given sources that have never had a successful access
    /// check, newest first. Returns `(article_id, url)` pairs.
    pub async fn articles_needing_probe(
        &self,
        source_ids: &[String],
        limit: u32,
    ) -> Result<Vec<(i64, String)>, StorageError> {
        if source_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT a.id, a.url FROM articles a WHERE a.source_id IN (");
        let mut separated = builder.separated(", ");
        for source in source_ids {
            separated.push_bind(source);
        }
        separated.push_unseparated(")");
        builder.push(
            " AND NOT EXISTS (SELECT 1 FROM access_checks ac \
             WHERE ac.article_id = a.id AND ac.status_code = 200) \
             ORDER BY a.published DESC, a.url ASC LIMIT ",
        );
        builder.push_bind(i64::from(limit));

        let rows: Vec<(i64, String)> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Append one access check observation. Network failures are recorded as 500.
    pub async fn record_access_check(
        &self,
        article_id: i64,
        status_code: u16,
        checked_at: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO access_checks (article_id, status_code, checked_at) VALUES (?, ?, ?)",
        )
        .bind(article_id)
        .bind(i64::from(status_code))
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
