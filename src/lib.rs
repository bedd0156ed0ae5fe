//! Scrape web sources into SQLite and republish them as RSS 2.0 / Atom feeds.
//!
//! The crate is organised leaf-first:
//!
//! - [`storage`] - SQLite persistence of articles, scrape runs and access checks
//! - [`scrape`] - fetch, parse and reconcile source pages; access probing
//! - [`publish`] - feed rendering and the HTTP surface
//! - [`config`] - TOML configuration of sources, feeds and runtime knobs
//! - [`util`] - URL canonicalization and text cleanup shared by the above

pub mod config;
pub mod publish;
pub mod scrape;
pub mod storage;
pub mod util;
