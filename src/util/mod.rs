//! Utility functions for common operations.
//!
//! This module provides reusable utilities for:
//!
//! - **URL handling**: endpoint validation and canonicalization of scraped links
//! - **Text processing**: control-character stripping, whitespace normalization,
//!   excerpt truncation and HTML escaping
//!
//! # Examples
//!
//! ```
//! use refeed::util::{canonicalize_url, clean_text, validate_url};
//!
//! let base = validate_url("https://lwn.net/headlines/").unwrap();
//! let key = canonicalize_url(&base, "/Articles/1000/#Comments").unwrap();
//! assert_eq!(key.as_str(), "https://lwn.net/Articles/1000/");
//!
//! assert_eq!(clean_text("  Kernel \n news ").as_deref(), Some("Kernel news"));
//! ```

mod text;
mod url_validator;

pub use url_validator::{canonicalize_url, validate_url, UrlValidationError};
pub use text::{clean_text, escape_html, normalize_whitespace, strip_control_chars, truncate_chars};

/// Maximum length of a stored summary excerpt, in characters
pub const MAX_SUMMARY_CHARS: usize = 2000;
