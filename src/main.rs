use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use refeed::config::Config;
use refeed::publish::{self, Listen};
use refeed::scrape::{cancellation, Scraper};
use refeed::storage::{Database, DatabaseError, RunStatus};

#[derive(Parser, Debug)]
#[command(
    name = "refeed",
    version,
    about = "Scrape web sources and republish them as RSS/Atom feeds"
)]
struct Args {
    /// Path to the SQLite database (required)
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    /// TOML configuration file (built-in LWN defaults when absent)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level; RUST_LOG takes precedence when set
    #[arg(long, value_enum, ignore_case = true, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or migrate the database schema
    Initialize,
    /// Run the scrape pipeline once and print the run summary as JSON
    Scrape,
    /// Serve feeds over HTTP
    Serve {
        /// HOST:PORT to listen on (defaults to server.listen_address)
        #[arg(long, value_name = "HOST:PORT", conflicts_with = "listen_socket")]
        listen_address: Option<String>,

        /// Unix socket to listen on
        #[arg(long, value_name = "PATH")]
        listen_socket: Option<PathBuf>,
    },
    /// Print recent scrape runs as JSON
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Args {
    /// `--db` may sit before or after the subcommand but must be given.
    fn database_path(&self) -> Result<&Path, clap::Error> {
        self.db.as_deref().ok_or_else(|| {
            Args::command().error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "the following required argument was not provided: --db <PATH>",
            )
        })
    }
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::Locked) => {
            eprintln!("Error: The database at {} is locked by another process.", path.display());
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let db_path = match args.database_path() {
        Ok(path) => path.to_path_buf(),
        Err(e) => e.exit(),
    };

    // stdout carries JSON output; logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let db = open_database(&db_path).await?;

    match args.command {
        Command::Initialize => {
            let version = db.schema_version().await?;
            tracing::info!(path = %db_path.display(), version = version, "Database initialized");
            println!(
                "Database initialized at {} (schema version {})",
                db_path.display(),
                version
            );
        }
        Command::Scrape => {
            let scraper = Scraper::new(db, &config).context("Failed to build HTTP client")?;
            let (cancel_handle, cancel) = cancellation();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling scrape run");
                    cancel_handle.cancel();
                }
            });

            let run = scraper.run(&cancel).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&run).context("Failed to serialize run summary")?
            );
            if run.status != RunStatus::Success {
                std::process::exit(1);
            }
        }
        Command::Serve {
            listen_address,
            listen_socket,
        } => {
            let listen = match (listen_socket, listen_address) {
                (Some(socket), _) => Listen::Unix(socket),
                (None, Some(address)) => Listen::Tcp(address),
                (None, None) => Listen::Tcp(config.server.listen_address.clone()),
            };
            publish::serve(db, &config, listen).await?;
        }
        Command::Runs { limit } => {
            let runs = db.recent_runs(limit).await.context("Failed to load runs")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&runs).context("Failed to serialize runs")?
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_log_level_ignores_case() {
        let args = Args::try_parse_from(["refeed", "--db", "x.db", "--log-level", "DEBUG", "scrape"])
            .unwrap();
        assert!(matches!(args.log_level, LogLevel::Debug));
        assert!(matches!(args.command, Command::Scrape));
    }

    #[test]
    fn test_serve_listen_flags_conflict() {
        let err = Args::try_parse_from([
            "refeed",
            "--db",
            "x.db",
            "serve",
            "--listen-address",
            "127.0.0.1:8080",
            "--listen-socket",
            "/tmp/refeed.sock",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_db_is_required() {
        let args = Args::try_parse_from(["refeed", "initialize"]).unwrap();
        let err = args.database_path().unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_flags_accepted_after_subcommand() {
        let args = Args::try_parse_from(["refeed", "initialize", "--db", "x.db"]).unwrap();
        assert_eq!(args.database_path().unwrap(), Path::new("x.db"));
        assert!(matches!(args.command, Command::Initialize));

        let args =
            Args::try_parse_from(["refeed", "scrape", "--db", "x.db", "--log-level", "DEBUG"])
                .unwrap();
        assert_eq!(args.database_path().unwrap(), Path::new("x.db"));
        assert!(matches!(args.log_level, LogLevel::Debug));

        let args = Args::try_parse_from([
            "refeed",
            "serve",
            "--listen-socket",
            "/tmp/refeed.sock",
            "--db",
            "x.db",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::Serve { listen_socket: Some(_), .. }
        ));
    }
}
