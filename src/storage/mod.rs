mod access;
mod articles;
mod runs;
mod schema;
mod types;

pub use schema::{Database, SCHEMA_VERSION};
pub use types::{
    Article, ArticleQuery, ArticleRecord, DatabaseError, RunStatus, RunTotals, ScrapeRun,
    SourceCounts, StorageError,
};
