use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::parser::{CandidateArticle, RecordSkipped};
use crate::storage::{ArticleRecord, Database, StorageError};
use crate::util::normalize_whitespace;

/// Content fingerprint over normalized title and summary.
///
/// Whitespace differences do not change the fingerprint; any other edit does.
pub fn fingerprint(title: &str, summary: Option<&str>) -> String {
    let input = format!(
        "{}\u{1f}{}",
        normalize_whitespace(title),
        summary.map(normalize_whitespace).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

/// What reconciling one candidate did to storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Counters for one source across all of its pages in a run.
#[derive(Debug, Default, Clone)]
pub struct ReconcileStats {
    pub new: i64,
    pub updated: i64,
    /// Malformed records, unchanged articles and repeats of an already seen key
    pub skipped: i64,
    /// Records that could not be committed
    pub failed: i64,
    seen: HashSet<String>,
}

/// The only writer of articles. Decides insert vs. update vs. no-op per
/// candidate against the current stored state.
#[derive(Clone)]
pub struct Reconciler {
    db: Database,
}

impl Reconciler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Reconcile one page worth of parser output into `stats`.
    ///
    /// A natural key seen earlier in the same `stats` is skipped, so the first
    /// occurrence within a run wins and replaying the same input writes nothing.
    pub async fn reconcile<I>(&self, source_id: &str, candidates: I, now: i64, stats: &mut ReconcileStats)
    where
        I: IntoIterator<Item = Result<CandidateArticle, RecordSkipped>>,
    {
        for candidate in candidates {
            let candidate = match candidate {
                Ok(c) => c,
                Err(skipped) => {
                    tracing::debug!(source = %source_id, reason = %skipped.reason, "Skipping malformed record");
                    stats.skipped += 1;
                    continue;
                }
            };

            if !stats.seen.insert(candidate.natural_key().to_string()) {
                tracing::debug!(source = %source_id, url = %candidate.url, "Skipping repeated article");
                stats.skipped += 1;
                continue;
            }

            match self.reconcile_one(source_id, &candidate, now).await {
                Ok(Outcome::Inserted) => stats.new += 1,
                Ok(Outcome::Updated) => stats.updated += 1,
                Ok(Outcome::Unchanged) => stats.skipped += 1,
                Err(e) => {
                    tracing::warn!(source = %source_id, url = %candidate.url, error = %e, "Failed to store article");
                    stats.failed += 1;
                }
            }
        }
    }

    /// Reconcile a single candidate. A write conflict is retried once after
    /// re-reading the stored row.
    pub async fn reconcile_one(
        &self,
        source_id: &str,
        candidate: &CandidateArticle,
        now: i64,
    ) -> Result<Outcome, StorageError> {
        let record = ArticleRecord {
            url: candidate.natural_key().to_string(),
            source_id: source_id.to_string(),
            title: candidate.title.clone(),
            category: candidate.category.clone(),
            summary: candidate.summary.clone(),
            published: candidate.published.map(|p| p.timestamp()),
            fingerprint: fingerprint(&candidate.title, candidate.summary.as_deref()),
        };

        match self.try_reconcile(&record, now).await {
            Err(StorageError::Conflict { key }) => {
                tracing::debug!(url = %key, "Write conflict, re-reading once");
                self.try_reconcile(&record, now).await
            }
            other => other,
        }
    }

    async fn try_reconcile(&self, record: &ArticleRecord, now: i64) -> Result<Outcome, StorageError> {
        match self.db.find_article(&record.url).await? {
            None => {
                self.db.insert_article(record, now).await?;
                Ok(Outcome::Inserted)
            }
            Some(existing) if existing.fingerprint == record.fingerprint => Ok(Outcome::Unchanged),
            Some(existing) => {
                self.db
                    .update_article(record, &existing.fingerprint, now)
                    .await?;
                Ok(Outcome::Updated)
            }
        }
    }
}
