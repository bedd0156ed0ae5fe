//! Scraping pipeline: fetch source pages, extract candidate articles and
//! reconcile them into storage.
//!
//! - [`fetcher`] - HTTP retrieval with retry, backoff and size limits
//! - [`parser`] - ruleset-driven extraction of candidate records
//! - [`reconciler`] - insert / update / no-op decisions against storage
//! - [`pipeline`] - runs every source on a bounded pool and records the run
//! - [`probe`] - access checks for stored articles
//!
//! A run is cancelled through a [`CancelHandle`]; every stage observes the
//! matching [`Cancellation`] at its boundaries and while waiting on the network.

pub mod fetcher;
pub mod parser;
pub mod pipeline;
pub mod probe;
pub mod reconciler;

use tokio::sync::watch;

pub use fetcher::{ErrorKind, FetchError, Fetcher};
pub use parser::{parse_page, CandidateArticle, ParseError, ParsedPage, RecordSkipped};
pub use pipeline::Scraper;
pub use probe::{probe_access, ProbeSummary};
pub use reconciler::{fingerprint, Outcome, ReconcileStats, Reconciler};

// ============================================================================
// Cancellation
// ============================================================================

/// Read side of a cancellation flag. Cheap to clone; every clone observes the
/// same flag.
#[derive(Clone, Debug)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

/// Write side of a cancellation flag.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a linked cancel handle and flag.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Cancellation {
    /// A flag that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
