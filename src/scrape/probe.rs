use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Duration;

use super::Cancellation;
use crate::storage::{Database, StorageError};

/// Status recorded when the article URL could not be reached at all
pub const NETWORK_FAILURE_STATUS: u16 = 500;

const PROBE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub checked: usize,
    /// Articles that answered 200
    pub free: usize,
}

/// Check whether stored articles are freely readable.
///
/// Probes up to `limit` articles from `source_ids` that have no successful
/// check yet, newest first, and appends one access check per article. A
/// request that fails outright is recorded as status 500. Stops issuing new
/// probes once `cancel` is raised.
pub async fn probe_access(
    db: &Database,
    client: &reqwest::Client,
    source_ids: &[String],
    limit: u32,
    timeout: Duration,
    cancel: &Cancellation,
) -> Result<ProbeSummary, StorageError> {
    let pending = db.articles_needing_probe(source_ids, limit).await?;
    if pending.is_empty() {
        return Ok(ProbeSummary::default());
    }

    tracing::info!(count = pending.len(), "Probing article access");

    let statuses: Vec<(i64, u16)> = stream::iter(pending)
        .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
        .map(|(article_id, url)| async move {
            let status = tokio::select! {
                _ = cancel.cancelled() => None,
                status = check_status(client, &url, timeout) => Some(status),
            };
            status.map(|s| (article_id, s))
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .filter_map(futures::future::ready)
        .collect()
        .await;

    let checked_at = Utc::now().timestamp();
    let mut summary = ProbeSummary::default();
    for (article_id, status) in statuses {
        db.record_access_check(article_id, status, checked_at).await?;
        summary.checked += 1;
        if status == 200 {
            summary.free += 1;
        }
    }

    tracing::info!(checked = summary.checked, free = summary.free, "Access probe complete");
    Ok(summary)
}

async fn check_status(client: &reqwest::Client, url: &str, timeout: Duration) -> u16 {
    match tokio::time::timeout(timeout, client.get(url).send()).await {
        Ok(Ok(response)) => response.status().as_u16(),
        Ok(Err(e)) => {
            tracing::debug!(url = %url, error = %e, "Access probe request failed");
            NETWORK_FAILURE_STATUS
        }
        Err(_) => {
            tracing::debug!(url = %url, "Access probe timed out");
            NETWORK_FAILURE_STATUS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ArticleQuery, ArticleRecord};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn seed(db: &Database, url: &str, published: i64) {
        db.insert_article(
            &ArticleRecord {
                url: url.to_string(),
                source_id: "lwn".to_string(),
                title: url.to_string(),
                category: None,
                summary: None,
                published: Some(published),
                fingerprint: "fp".to_string(),
            },
            1,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_probe_records_statuses() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/free"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paid"))
            .respond_with(ResponseTemplate::new(403))
            .expect(2)
            .mount(&mock_server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        seed(&db, &format!("{}/free", mock_server.uri()), 2).await;
        seed(&db, &format!("{}/paid", mock_server.uri()), 1).await;
        // Unreachable port: recorded as a network failure
        seed(&db, "http://127.0.0.1:9/gone", 0).await;

        let client = reqwest::Client::new();
        let sources = vec!["lwn".to_string()];
        let cancel = Cancellation::never();

        let summary = probe_access(&db, &client, &sources, 10, Duration::from_secs(2), &cancel)
            .await
            .unwrap();
        assert_eq!(summary, ProbeSummary { checked: 3, free: 1 });

        let free = db
            .query_articles(&ArticleQuery {
                free_only: true,
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(free.len(), 1);
        assert!(free[0].url.ends_with("/free"));

        // Free articles are not probed again
        let summary = probe_access(&db, &client, &sources, 10, Duration::from_secs(2), &cancel)
            .await
            .unwrap();
        assert_eq!(summary, ProbeSummary { checked: 2, free: 0 });
    }

    #[tokio::test]
    async fn test_probe_cancelled_checks_nothing() {
        let db = Database::open(":memory:").await.unwrap();
        seed(&db, "http://127.0.0.1:9/x", 1).await;

        let (handle, cancel) = crate::scrape::cancellation();
        handle.cancel();

        let client = reqwest::Client::new();
        let summary = probe_access(
            &db,
            &client,
            &["lwn".to_string()],
            10,
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(summary.checked, 0);
    }
}
