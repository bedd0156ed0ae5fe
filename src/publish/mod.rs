//! Feed publishing: rendering stored articles as RSS 2.0 / Atom 1.0 and
//! serving them over HTTP.
//!
//! - [`builder`] - pure rendering plus the storage read for a named feed
//! - [`server`] - `axum` router, scheduled scrapes and the accept loop

pub mod builder;
pub mod server;

pub use builder::{build_feed, render_feed, RenderedFeed, ATOM_CONTENT_TYPE, RSS_CONTENT_TYPE};
pub use server::{router, serve, spawn_schedule, AppState, Listen};
