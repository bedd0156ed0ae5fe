use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while opening or migrating the database
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The database is locked by another process. Please close it and try again.")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The file was written by a newer release
    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: i64, supported: i64 },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err) {
            return DatabaseError::Locked;
        }
        DatabaseError::Other(err)
    }
}

/// Errors raised by record-level reads and writes
#[derive(Debug, Error)]
pub enum StorageError {
    /// A guarded write lost a race: the row appeared, vanished or changed
    /// between read and write. Callers re-read and decide again.
    #[error("Write conflict on {key}")]
    Conflict { key: String },

    /// The database could not be reached or stayed locked past busy_timeout
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Other(sqlx::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StorageError::Unavailable(err.to_string())
            }
            _ if is_lock_error(&err) => StorageError::Unavailable(err.to_string()),
            _ => StorageError::Other(err),
        }
    }
}

// SQLITE_BUSY (5): database is locked
// SQLITE_LOCKED (6): database table is locked
// SQLITE_CANTOPEN (14): unable to open database file
fn is_lock_error(err: &sqlx::Error) -> bool {
    let error_string = err.to_string().to_lowercase();
    error_string.contains("database is locked")
        || error_string.contains("database table is locked")
        || error_string.contains("sqlite_busy")
        || error_string.contains("sqlite_locked")
        || error_string.contains("unable to open database file")
}

// ============================================================================
// Articles
// ============================================================================

/// An article as handed to storage by the reconciler.
///
/// `url` is the canonical natural key; `fingerprint` is already computed.
#[derive(Debug, Clone)]
pub struct ArticleRecord {
    pub url: String,
    pub source_id: String,
    pub title: String,
    pub category: Option<String>,
    pub summary: Option<String>,
    /// Unix seconds. `None` keeps the stored value on update and falls back to
    /// first-seen time on insert.
    pub published: Option<i64>,
    pub fingerprint: String,
}

/// Internal row type for Article queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub url: String,
    pub source_id: String,
    pub title: String,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub published: i64,
    pub first_seen: i64,
    pub last_updated: i64,
    pub fingerprint: String,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            url: self.url,
            source_id: self.source_id,
            title: self.title,
            category: self.category,
            summary: self.summary,
            published: from_unix(self.published),
            first_seen: from_unix(self.first_seen),
            last_updated: from_unix(self.last_updated),
            fingerprint: self.fingerprint,
        }
    }
}

/// A persisted article
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Article {
    pub id: i64,
    /// Canonical source URL, unique across the store
    pub url: String,
    pub source_id: String,
    pub title: String,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub published: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub fingerprint: String,
}

/// Selection applied when reading articles for a feed
#[derive(Debug, Clone, Default)]
pub struct ArticleQuery {
    /// Source ids to include (empty = all)
    pub sources: Vec<String>,
    /// Categories to include (empty = all)
    pub categories: Vec<String>,
    /// Only articles with a successful access check
    pub free_only: bool,
    pub limit: u32,
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// ============================================================================
// Scrape Runs
// ============================================================================

/// Lifecycle state of a scrape run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Per-source counters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SourceCounts {
    pub source_id: String,
    /// Pages fetched and parsed
    pub fetched: i64,
    pub new: i64,
    pub updated: i64,
    /// Malformed records plus unchanged articles
    pub skipped: i64,
    /// Failed pages plus records that could not be committed
    pub failed: i64,
    pub error: Option<String>,
}

impl SourceCounts {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }
}

/// Counters summed over every source of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub fetched: i64,
    pub new: i64,
    pub updated: i64,
    pub skipped: i64,
    pub failed: i64,
}

/// Audit record of one pipeline invocation
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub totals: RunTotals,
    pub sources: Vec<SourceCounts>,
}

impl ScrapeRun {
    pub(crate) fn totals_of(sources: &[SourceCounts]) -> RunTotals {
        sources.iter().fold(RunTotals::default(), |acc, s| RunTotals {
            fetched: acc.fetched + s.fetched,
            new: acc.new + s.new,
            updated: acc.updated + s.updated,
            skipped: acc.skipped + s.skipped,
            failed: acc.failed + s.failed,
        })
    }

    /// Counters for one source, if it took part in the run
    pub fn source(&self, source_id: &str) -> Option<&SourceCounts> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

/// Row type for scrape_runs queries
pub(crate) type RunRow = (i64, i64, Option<i64>, String);
