use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use super::builder::build_feed;
use crate::config::Config;
use crate::scrape::{cancellation, Cancellation, Scraper};
use crate::storage::Database;

/// Where the publisher accepts connections
#[derive(Debug, Clone)]
pub enum Listen {
    /// `HOST:PORT`
    Tcp(String),
    /// Path of a Unix domain socket
    Unix(PathBuf),
}

/// Shared state behind every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    db: Database,
    config: Arc<Config>,
    scraper: Arc<Scraper>,
    /// Held for the duration of a scrape run; one run per process
    run_lock: Arc<Mutex<()>>,
    shutdown: Cancellation,
}

impl AppState {
    pub fn new(db: Database, config: &Config, scraper: Scraper, shutdown: Cancellation) -> Self {
        Self {
            db,
            config: Arc::new(config.clone()),
            scraper: Arc::new(scraper),
            run_lock: Arc::new(Mutex::new(())),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/feeds/{name}", get(get_feed))
        .route("/scrape", post(trigger_scrape))
        // `/lwn.xml` style paths
        .route("/{file}", get(get_feed_file))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn healthz() -> &'static str {
    "ok"
}

async fn get_feed(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let name = name.strip_suffix(".xml").unwrap_or(&name);
    render(&state, name).await
}

async fn get_feed_file(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    match file.strip_suffix(".xml") {
        Some(name) => render(&state, name).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn render(state: &AppState, name: &str) -> Response {
    let Some(feed) = state.config.feed(name) else {
        tracing::debug!(feed = %name, "Unknown feed requested");
        return (StatusCode::NOT_FOUND, format!("unknown feed '{name}'\n")).into_response();
    };

    match build_feed(&state.db, feed).await {
        Ok(rendered) => (
            [(header::CONTENT_TYPE, rendered.content_type)],
            rendered.body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(feed = %name, error = %e, "Failed to render feed");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to render feed\n").into_response()
        }
    }
}

async fn trigger_scrape(State(state): State<AppState>) -> Response {
    let Ok(guard) = state.run_lock.clone().try_lock_owned() else {
        return (StatusCode::CONFLICT, "a scrape run is already in progress\n").into_response();
    };

    // The run lives in its own task so a dropped request cannot leave it unsealed
    let scraper = Arc::clone(&state.scraper);
    let shutdown = state.shutdown.clone();
    let task = tokio::spawn(async move {
        let _guard = guard;
        scraper.run(&shutdown).await
    });

    match task.await {
        Ok(Ok(run)) => Json(run).into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "On-demand scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "scrape failed\n").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "On-demand scrape task aborted");
            (StatusCode::INTERNAL_SERVER_ERROR, "scrape failed\n").into_response()
        }
    }
}

// ============================================================================
// Scheduling and serving
// ============================================================================

/// Run a scrape every `every`, starting immediately. Ticks that find a run
/// in progress are skipped. Stops when the state's shutdown flag is raised.
pub fn spawn_schedule(state: AppState, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Ok(_guard) = state.run_lock.try_lock() else {
                tracing::debug!("Scrape already running, skipping scheduled tick");
                continue;
            };

            match state.scraper.run(&state.shutdown).await {
                Ok(run) => tracing::debug!(run_id = run.id, status = %run.status, "Scheduled scrape done"),
                Err(e) => tracing::error!(error = %e, "Scheduled scrape failed"),
            }
        }
        tracing::debug!("Scrape schedule stopped");
    })
}

/// Serve feeds until Ctrl-C. Scheduled runs start when
/// `server.scrape_interval_minutes` is non-zero.
pub async fn serve(db: Database, config: &Config, listen: Listen) -> Result<()> {
    let scraper = Scraper::new(db.clone(), config).context("Failed to build HTTP client")?;
    let (cancel_handle, shutdown) = cancellation();
    let state = AppState::new(db, config, scraper, shutdown);

    let schedule = match config.server.scrape_interval_minutes {
        0 => None,
        minutes => {
            tracing::info!(every_minutes = minutes, "Scheduled scraping enabled");
            Some(spawn_schedule(
                state.clone(),
                Duration::from_secs(minutes.saturating_mul(60)),
            ))
        }
    };

    let app = router(state);
    let signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down");
        cancel_handle.cancel();
    };

    match listen {
        Listen::Tcp(address) => {
            let listener = tokio::net::TcpListener::bind(&address)
                .await
                .with_context(|| format!("Failed to bind {address}"))?;
            tracing::info!(address = %address, "Serving feeds");
            axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
                .context("HTTP server failed")?;
        }
        Listen::Unix(path) => {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
            }
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("Failed to bind {}", path.display()))?;
            tracing::info!(socket = %path.display(), "Serving feeds");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
                .context("HTTP server failed");
            let _ = std::fs::remove_file(&path);
            served?;
        }
    }

    if let Some(schedule) = schedule {
        let _ = schedule.await;
    }
    Ok(())
}
