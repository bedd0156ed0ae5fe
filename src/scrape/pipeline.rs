use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::time::Duration;

use super::fetcher::{FetchError, Fetcher};
use super::parser::parse_page;
use super::probe::probe_access;
use super::reconciler::{ReconcileStats, Reconciler};
use super::Cancellation;
use crate::config::{Config, Source};
use crate::storage::{Database, RunStatus, ScrapeRun, SourceCounts};

/// Runs fetch, parse and reconcile for every configured source and keeps the
/// audit trail of each run.
pub struct Scraper {
    db: Database,
    fetcher: Fetcher,
    reconciler: Reconciler,
    sources: Vec<Source>,
    concurrency: usize,
    probe_limit: u32,
    probe_timeout: Duration,
}

/// How one source's share of a run ended
struct SourceOutcome {
    counts: SourceCounts,
    /// Every page up to the pagination end was fetched and parsed
    completed: bool,
}

impl Scraper {
    pub fn new(db: Database, config: &Config) -> Result<Self, FetchError> {
        Ok(Self {
            fetcher: Fetcher::new(&config.fetch)?,
            reconciler: Reconciler::new(db.clone()),
            db,
            sources: config.sources.clone(),
            concurrency: config.scrape.concurrency.max(1),
            probe_limit: config.scrape.probe_limit,
            probe_timeout: Duration::from_secs(config.scrape.probe_timeout_secs),
        })
    }

    /// Execute one scrape run and return its sealed record.
    ///
    /// Sources run independently on a pool of `scrape.concurrency` workers. The
    /// run ends `success` when every source completed without record failures,
    /// `partial` when at least one source completed, `failed` otherwise.
    ///
    /// # Errors
    ///
    /// Only storage failures around the run record itself are returned; source
    /// level failures are recorded in the run.
    pub async fn run(&self, cancel: &Cancellation) -> Result<ScrapeRun> {
        let started_at = Utc::now().timestamp();
        let run_id = self
            .db
            .begin_run(started_at)
            .await
            .context("Failed to open scrape run")?;

        tracing::info!(run_id = run_id, sources = self.sources.len(), "Scrape run started");

        let work: Vec<_> = self
            .sources
            .iter()
            .map(|source| self.scrape_source(run_id, source, cancel))
            .collect();
        let outcomes: Vec<SourceOutcome> = stream::iter(work)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let completed = outcomes.iter().filter(|o| o.completed).count();
        let clean = outcomes.iter().all(|o| o.completed && o.counts.failed == 0);
        let status = if !outcomes.is_empty() && clean {
            RunStatus::Success
        } else if completed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        };

        if !cancel.is_cancelled() {
            self.probe(cancel).await;
        }

        let ended_at = Utc::now().timestamp().max(started_at);
        self.db
            .seal_run(run_id, status, ended_at)
            .await
            .with_context(|| format!("Failed to seal scrape run {run_id}"))?;

        let run = self
            .db
            .get_run(run_id)
            .await
            .with_context(|| format!("Failed to read scrape run {run_id}"))?
            .with_context(|| format!("Scrape run {run_id} vanished"))?;

        tracing::info!(
            run_id = run_id,
            status = %run.status,
            new = run.totals.new,
            updated = run.totals.updated,
            skipped = run.totals.skipped,
            failed = run.totals.failed,
            "Scrape run finished"
        );
        Ok(run)
    }

    async fn scrape_source(&self, run_id: i64, source: &Source, cancel: &Cancellation) -> SourceOutcome {
        let mut counts = SourceCounts::new(&source.id);
        let mut stats = ReconcileStats::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut completed = true;

        for page_index in 0..source.max_pages {
            if cancel.is_cancelled() {
                counts.error = Some(FetchError::Cancelled.to_string());
                completed = false;
                break;
            }

            let url = match Fetcher::page_url(source, cursor.as_deref()) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(source = %source.id, error = %e, "Unusable page cursor");
                    counts.failed += 1;
                    counts.error = Some(e.to_string());
                    completed = false;
                    break;
                }
            };

            if !visited.insert(url.to_string()) {
                tracing::debug!(source = %source.id, url = %url, "Pagination revisits a page, stopping");
                break;
            }

            let bytes = match self.fetcher.fetch(&url, cancel).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(source = %source.id, url = %url, error = %e, "Failed to fetch page");
                    counts.failed += 1;
                    counts.error = Some(e.to_string());
                    completed = false;
                    break;
                }
            };

            let page = match parse_page(&bytes, &source.ruleset, &url, source.category.as_deref()) {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(source = %source.id, url = %url, error = %e, "Failed to parse page");
                    counts.failed += 1;
                    counts.error = Some(e.to_string());
                    completed = false;
                    break;
                }
            };
            counts.fetched += 1;

            tracing::debug!(
                source = %source.id,
                page = page_index + 1,
                records = page.len(),
                "Parsed page"
            );

            let has_records = !page.is_empty();
            let now = Utc::now().timestamp();
            self.reconciler
                .reconcile(&source.id, page.candidates(), now, &mut stats)
                .await;

            // An empty page ends pagination even when it links onwards
            match page.next_cursor {
                Some(next) if has_records => cursor = Some(next),
                _ => break,
            }
        }

        counts.new = stats.new;
        counts.updated = stats.updated;
        counts.skipped = stats.skipped;
        counts.failed += stats.failed;

        // A source whose counters never reached the run record did not complete
        if let Err(e) = self.db.record_source(run_id, &counts).await {
            tracing::warn!(source = %source.id, run_id = run_id, error = %e, "Failed to record source counters");
            completed = false;
        }

        tracing::info!(
            source = %source.id,
            pages = counts.fetched,
            new = counts.new,
            updated = counts.updated,
            skipped = counts.skipped,
            failed = counts.failed,
            "Source scraped"
        );

        SourceOutcome { counts, completed }
    }

    async fn probe(&self, cancel: &Cancellation) {
        let probed: Vec<String> = self
            .sources
            .iter()
            .filter(|s| s.probe_access)
            .map(|s| s.id.clone())
            .collect();
        if probed.is_empty() || self.probe_limit == 0 {
            return;
        }

        if let Err(e) = probe_access(
            &self.db,
            self.fetcher.client(),
            &probed,
            self.probe_limit,
            self.probe_timeout,
            cancel,
        )
        .await
        {
            tracing::warn!(error = %e, "Access probe failed");
        }
    }
}
