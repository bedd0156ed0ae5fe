use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation and canonicalization.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates a URL string for use as a fetch endpoint.
///
/// Only `http` and `https` URLs with a host are accepted. Unlike a reader
/// that follows arbitrary links, sources here are operator-configured, so
/// loopback and private addresses are allowed.
///
/// # Examples
///
/// ```
/// use refeed::util::validate_url;
///
/// let url = validate_url("https://lwn.net/headlines/text").unwrap();
/// assert_eq!(url.host_str(), Some("lwn.net"));
///
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;
    check_http(url)
}

/// Resolves `href` against `base` and returns the canonical form used as an
/// article's natural key.
///
/// Canonical means: absolute, http(s) only, host lower-cased, default port and
/// dot segments removed (all done by `url`), fragment dropped and an empty
/// query (`?`) removed. Two links that point at the same document therefore
/// produce byte-identical keys.
pub fn canonicalize_url(base: &Url, href: &str) -> Result<Url, UrlValidationError> {
    let mut url = base.join(href.trim())?;
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    check_http(url)
}

fn check_http(url: Url) -> Result<Url, UrlValidationError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://Example.COM:443/news/index.html").unwrap()
    }

    #[test]
    fn test_valid_urls() {
        assert!(validate_url("https://example.com/feed.xml").is_ok());
        assert!(validate_url("http://127.0.0.1:8080/headlines").is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(matches!(
            validate_url("file:///etc/passwd"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_unparseable_url() {
        assert!(matches!(
            validate_url("not a url"),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_canonicalize_relative_link() {
        let url = canonicalize_url(&base(), "../articles/42#comments").unwrap();
        assert_eq!(url.as_str(), "https://example.com/articles/42");
    }

    #[test]
    fn test_canonicalize_equivalent_forms_match() {
        let a = canonicalize_url(&base(), "/Articles/1").unwrap();
        let b = canonicalize_url(&base(), "https://EXAMPLE.com:443/Articles/1?#top").unwrap();
        let c = canonicalize_url(&base(), "  ./../Articles/1 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_canonicalize_keeps_meaningful_query() {
        let url = canonicalize_url(&base(), "/Articles/1?page=2").unwrap();
        assert_eq!(url.as_str(), "https://example.com/Articles/1?page=2");
    }

    #[test]
    fn test_canonicalize_rejects_non_http() {
        assert!(canonicalize_url(&base(), "mailto:editor@example.com").is_err());
        assert!(canonicalize_url(&base(), "javascript:void(0)").is_err());
    }
}
