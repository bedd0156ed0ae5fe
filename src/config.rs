//! Configuration file parser for the scraper's TOML config.
//!
//! The config file is optional: a missing or empty file yields
//! `Config::default()`, which scrapes the LWN.net text headlines and publishes
//! the `lwn` and `lwn_free` feeds. Unknown top-level keys are accepted but
//! logged, since they are usually typos.
//!
//! Every loaded config is validated before it is handed out. An invalid
//! source or feed definition is fatal: nothing runs against it.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::util::validate_url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid source definition '{id}': {reason}")]
    InvalidSource { id: String, reason: String },

    #[error("Invalid feed definition '{name}': {reason}")]
    InvalidFeed { name: String, reason: String },
}

// ============================================================================
// Sources
// ============================================================================

/// A configured origin to scrape. Immutable for the duration of a run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Source {
    /// Stable identifier, recorded on every article and run counter row.
    pub id: String,
    /// Fetch endpoint. May contain a `{cursor}` placeholder for pagination.
    pub endpoint: String,
    /// How to turn fetched bytes into candidate articles.
    pub ruleset: Ruleset,
    /// Category applied to articles whose ruleset yields none.
    #[serde(default)]
    pub category: Option<String>,
    /// Upper bound on pages followed per run.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Whether stored articles from this source are probed for free access.
    #[serde(default)]
    pub probe_access: bool,
}

fn default_max_pages() -> u32 {
    1
}

/// Parsing ruleset, tagged by `kind` in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ruleset {
    /// The LWN.net plain-text headlines file.
    LwnText,
    /// CSS-selector driven extraction from an HTML listing page.
    Html(HtmlRules),
}

/// Selectors for the `html` ruleset. `title`, `link` and `date` are resolved
/// inside each `item` match.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HtmlRules {
    pub item: String,
    pub title: String,
    pub link: String,
    /// Attribute holding the link target (default `href`).
    #[serde(default)]
    pub link_attr: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    /// Attribute holding the date (e.g. `datetime` on `<time>`); text is used when unset.
    #[serde(default)]
    pub date_attr: Option<String>,
    /// chrono format string tried after RFC 3339 and RFC 2822.
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Link to the following page, searched in the whole document.
    #[serde(default)]
    pub next_page: Option<String>,
}

impl HtmlRules {
    fn selectors(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("item", Some(self.item.as_str())),
            ("title", Some(self.title.as_str())),
            ("link", Some(self.link.as_str())),
            ("date", self.date.as_deref()),
            ("summary", self.summary.as_deref()),
            ("category", self.category.as_deref()),
            ("next_page", self.next_page.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, sel)| sel.map(|s| (name, s)))
    }
}

// ============================================================================
// Feeds
// ============================================================================

/// Output format of a published feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[default]
    Rss,
    Atom,
}

/// A named view over stored articles.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedDefinition {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Link to the website the feed mirrors.
    pub link: String,
    /// Restrict to these source ids (empty = all sources).
    #[serde(default)]
    pub sources: Vec<String>,
    /// Restrict to these categories (empty = all categories).
    #[serde(default)]
    pub categories: Vec<String>,
    /// Only articles whose access probe returned 200.
    #[serde(default)]
    pub free_only: bool,
    #[serde(default = "default_max_items")]
    pub max_items: u32,
    #[serde(default)]
    pub format: FeedFormat,
}

fn default_max_items() -> u32 {
    50
}

// ============================================================================
// Runtime Settings
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-attempt timeout covering request and body.
    pub timeout_secs: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub backoff_base_ms: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 1000,
            user_agent: concat!("refeed/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Sources fetched simultaneously.
    pub concurrency: usize,
    /// Articles probed for free access per run.
    pub probe_limit: u32,
    pub probe_timeout_secs: u64,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            probe_limit: 50,
            probe_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    /// Minutes between scheduled scrape runs. 0 = on-demand only.
    pub scrape_interval_minutes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
            scrape_interval_minutes: 0,
        }
    }
}

// ============================================================================
// Top-level Configuration
// ============================================================================

/// Top-level application configuration.
///
/// Built from [`RawConfig`]: any subset of sections can be specified. When no
/// `[[sources]]` are given the LWN defaults apply, and the default feeds only
/// come along when `[[feeds]]` is absent too.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub sources: Vec<Source>,
    pub feeds: Vec<FeedDefinition>,
    pub fetch: FetchConfig,
    pub scrape: ScrapeConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: vec![Source {
                id: "lwn".to_string(),
                endpoint: "https://lwn.net/headlines/text".to_string(),
                ruleset: Ruleset::LwnText,
                category: None,
                max_pages: 1,
                probe_access: true,
            }],
            feeds: vec![
                FeedDefinition {
                    name: "lwn".to_string(),
                    title: "LWN Articles".to_string(),
                    description: Some("Headlines scraped from LWN.net".to_string()),
                    link: "https://lwn.net".to_string(),
                    sources: vec!["lwn".to_string()],
                    categories: Vec::new(),
                    free_only: false,
                    max_items: default_max_items(),
                    format: FeedFormat::Rss,
                },
                FeedDefinition {
                    name: "lwn_free".to_string(),
                    title: "LWN Free Articles".to_string(),
                    description: Some("LWN.net articles readable without a subscription".to_string()),
                    link: "https://lwn.net".to_string(),
                    sources: vec!["lwn".to_string()],
                    categories: Vec::new(),
                    free_only: true,
                    max_items: default_max_items(),
                    format: FeedFormat::Rss,
                },
            ],
            fetch: FetchConfig::default(),
            scrape: ScrapeConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Hard cap on items per feed regardless of configuration.
    pub const MAX_FEED_ITEMS: u32 = 500;

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing file → defaults
    /// - Empty file → defaults
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown top-level keys → accepted, logged as warning
    /// - Semantically invalid sources/feeds → `Err(ConfigError::InvalidSource / InvalidFeed)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Size check before reading the file
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Self::default().validated();
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Self::default().validated();
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Self::default().validated();
        }

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            feeds = config.feeds.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = ["sources", "feeds", "fetch", "scrape", "server"];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let raw: RawConfig = toml::from_str(content)?;
        Config::from(raw).validated()
    }

    /// Validate, returning the config unchanged on success.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Check every source and feed definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::InvalidSource {
                id: String::new(),
                reason: "at least one source must be configured".to_string(),
            });
        }

        let mut source_ids = HashSet::new();
        for source in &self.sources {
            validate_source(source)?;
            if !source_ids.insert(source.id.as_str()) {
                return Err(invalid_source(source, "duplicate source id"));
            }
        }

        let mut feed_names = HashSet::new();
        for feed in &self.feeds {
            validate_feed(feed, &source_ids)?;
            if !feed_names.insert(feed.name.as_str()) {
                return Err(invalid_feed(feed, "duplicate feed name"));
            }
        }

        if self.scrape.concurrency == 0 {
            return Err(ConfigError::InvalidSource {
                id: String::new(),
                reason: "scrape.concurrency must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Look up a feed definition by name.
    pub fn feed(&self, name: &str) -> Option<&FeedDefinition> {
        self.feeds.iter().find(|f| f.name == name)
    }
}

/// Config file as written, before defaults for absent sections are filled in.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    sources: Option<Vec<Source>>,
    feeds: Option<Vec<FeedDefinition>>,
    fetch: FetchConfig,
    scrape: ScrapeConfig,
    server: ServerConfig,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        let defaults = Config::default();
        let (sources, feeds) = match (raw.sources, raw.feeds) {
            (None, None) => (defaults.sources, defaults.feeds),
            (None, Some(feeds)) => (defaults.sources, feeds),
            (Some(sources), feeds) => (sources, feeds.unwrap_or_default()),
        };
        Self {
            sources,
            feeds,
            fetch: raw.fetch,
            scrape: raw.scrape,
            server: raw.server,
        }
    }
}

fn invalid_source(source: &Source, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidSource {
        id: source.id.clone(),
        reason: reason.into(),
    }
}

fn invalid_feed(feed: &FeedDefinition, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidFeed {
        name: feed.name.clone(),
        reason: reason.into(),
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_source(source: &Source) -> Result<(), ConfigError> {
    if !is_identifier(&source.id) {
        return Err(invalid_source(
            source,
            "id must be non-empty and contain only [A-Za-z0-9_-]",
        ));
    }

    let endpoint = source.endpoint.replace("{cursor}", "");
    if let Err(e) = validate_url(&endpoint) {
        return Err(invalid_source(source, format!("endpoint: {e}")));
    }

    if source.max_pages == 0 || source.max_pages > 100 {
        return Err(invalid_source(source, "max_pages must be between 1 and 100"));
    }

    if let Ruleset::Html(rules) = &source.ruleset {
        for (name, selector) in rules.selectors() {
            if let Err(e) = scraper::Selector::parse(selector) {
                return Err(invalid_source(
                    source,
                    format!("{name} selector '{selector}' is invalid: {e}"),
                ));
            }
        }
        if rules.date_format.is_some() && rules.date.is_none() {
            return Err(invalid_source(source, "date_format requires a date selector"));
        }
    }

    Ok(())
}

fn validate_feed(feed: &FeedDefinition, source_ids: &HashSet<&str>) -> Result<(), ConfigError> {
    let valid_name = !feed.name.is_empty()
        && feed
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid_name {
        return Err(invalid_feed(
            feed,
            "name must be non-empty and contain only [A-Za-z0-9_.-]",
        ));
    }

    if feed.title.trim().is_empty() {
        return Err(invalid_feed(feed, "title must not be empty"));
    }

    if let Err(e) = validate_url(&feed.link) {
        return Err(invalid_feed(feed, format!("link: {e}")));
    }

    if feed.max_items == 0 || feed.max_items > Config::MAX_FEED_ITEMS {
        return Err(invalid_feed(
            feed,
            format!("max_items must be between 1 and {}", Config::MAX_FEED_ITEMS),
        ));
    }

    if let Some(unknown) = feed.sources.iter().find(|s| !source_ids.contains(s.as_str())) {
        return Err(invalid_feed(feed, format!("unknown source '{unknown}'")));
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const HTML_SOURCE: &str = r#"
[[sources]]
id = "blog"
endpoint = "https://blog.example.com/posts?page={cursor}"
max_pages = 3

[sources.ruleset]
kind = "html"
item = "article.post"
title = "h2"
link = "h2 a"
date = "time"
date_attr = "datetime"
summary = "p.excerpt"
next_page = "a.next"

[[feeds]]
name = "blog"
title = "Example Blog"
link = "https://blog.example.com"
sources = ["blog"]
format = "atom"
max_items = 20
"#;

    fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("refeed_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].id, "lwn");
        assert!(matches!(config.sources[0].ruleset, Ruleset::LwnText));
        assert!(config.feed("lwn").is_some());
        assert!(config.feed("lwn_free").unwrap().free_only);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/refeed_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.sources[0].id, "lwn");
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let path = write_temp("whitespace", "   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.feeds.len(), 2);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_html_source_parses() {
        let path = write_temp("html", HTML_SOURCE);
        let config = Config::load(&path).unwrap();

        let source = &config.sources[0];
        assert_eq!(source.max_pages, 3);
        assert!(!source.probe_access);
        match &source.ruleset {
            Ruleset::Html(rules) => {
                assert_eq!(rules.item, "article.post");
                assert_eq!(rules.date_attr.as_deref(), Some("datetime"));
                assert_eq!(rules.next_page.as_deref(), Some("a.next"));
            }
            other => panic!("Expected html ruleset, got {:?}", other),
        }

        let feed = config.feed("blog").unwrap();
        assert_eq!(feed.format, FeedFormat::Atom);
        assert_eq!(feed.max_items, 20);
        // Sections not present fall back to defaults
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.scrape.concurrency, 4);

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_sources_without_feeds_publishes_nothing() {
        let content = r#"
[[sources]]
id = "other"
endpoint = "https://other.example.com/headlines"
[sources.ruleset]
kind = "lwn_text"
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.sources[0].id, "other");
        assert!(config.feeds.is_empty());
    }

    #[test]
    fn test_fetch_section_only_keeps_default_sources() {
        let config = Config::from_toml("[fetch]\nmax_retries = 1\n").unwrap();
        assert_eq!(config.fetch.max_retries, 1);
        assert_eq!(config.fetch.timeout_secs, 30);
        assert_eq!(config.sources[0].id, "lwn");
        assert_eq!(config.feeds.len(), 2);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::from_toml("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_ruleset_kind_rejected() {
        let content = r#"
[[sources]]
id = "x"
endpoint = "https://example.com"
[sources.ruleset]
kind = "json_api"
"#;
        assert!(matches!(
            Config::from_toml(content),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_bad_selector_is_invalid_source() {
        let content = HTML_SOURCE.replace(r#"item = "article.post""#, r#"item = "article[[""#);
        match Config::from_toml(&content) {
            Err(ConfigError::InvalidSource { id, reason }) => {
                assert_eq!(id, "blog");
                assert!(reason.contains("item selector"));
            }
            other => panic!("Expected InvalidSource, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_endpoint_is_invalid_source() {
        let content = HTML_SOURCE.replace("https://blog.example.com/posts", "ftp://blog.example.com/posts");
        assert!(matches!(
            Config::from_toml(&content),
            Err(ConfigError::InvalidSource { .. })
        ));
    }

    #[test]
    fn test_duplicate_source_ids_rejected() {
        let mut config = Config::default();
        config.sources.push(config.sources[0].clone());
        match config.validate() {
            Err(ConfigError::InvalidSource { reason, .. }) => assert!(reason.contains("duplicate")),
            other => panic!("Expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_no_sources_rejected() {
        let mut config = Config::default();
        config.sources.clear();
        config.feeds.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSource { .. })
        ));
    }

    #[test]
    fn test_feed_with_unknown_source_rejected() {
        let mut config = Config::default();
        config.feeds[0].sources = vec!["nope".to_string()];
        match config.validate() {
            Err(ConfigError::InvalidFeed { name, reason }) => {
                assert_eq!(name, "lwn");
                assert!(reason.contains("nope"));
            }
            other => panic!("Expected InvalidFeed, got {:?}", other),
        }
    }

    #[test]
    fn test_feed_max_items_bounds() {
        let mut config = Config::default();
        config.feeds[0].max_items = 0;
        assert!(config.validate().is_err());
        config.feeds[0].max_items = Config::MAX_FEED_ITEMS + 1;
        assert!(config.validate().is_err());
        config.feeds[0].max_items = Config::MAX_FEED_ITEMS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_too_large_file_rejected() {
        let path = write_temp("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
