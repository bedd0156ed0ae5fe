use futures::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::Cancellation;
use crate::config::{FetchConfig, Source};
use crate::util::validate_url;

const MAX_PAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_REDIRECTS: usize = 5;

/// Placeholder substituted with the pagination cursor in source endpoints
pub const CURSOR_PLACEHOLDER: &str = "{cursor}";

/// Whether retrying a failed fetch can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Errors that can occur while retrieving a source page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// A single attempt exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Endpoint or cursor does not resolve to an http(s) URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// The run was cancelled while the fetch was in flight
    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(e) if e.is_builder() || e.is_redirect() => ErrorKind::Permanent,
            FetchError::Network(_)
            | FetchError::Timeout
            | FetchError::IncompleteResponse { .. } => ErrorKind::Transient,
            FetchError::HttpStatus(status) if *status == 429 || *status >= 500 => {
                ErrorKind::Transient
            }
            FetchError::HttpStatus(_)
            | FetchError::RateLimited(_)
            | FetchError::ResponseTooLarge
            | FetchError::InvalidUrl(_)
            | FetchError::Cancelled => ErrorKind::Permanent,
        }
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

// ============================================================================
// Fetcher
// ============================================================================

/// HTTP retrieval of source pages. Holds no shared mutable state; clone freely.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(config.timeout())
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            timeout: config.timeout(),
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
        })
    }

    /// The underlying HTTP client, shared with the access probe.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Resolve the URL of one page of a source.
    ///
    /// No cursor yields the endpoint with the placeholder removed. A cursor is
    /// substituted into a `{cursor}` endpoint, and otherwise treated as a link
    /// relative to the endpoint.
    pub fn page_url(source: &Source, cursor: Option<&str>) -> Result<Url, FetchError> {
        let invalid = |e: crate::util::UrlValidationError| FetchError::InvalidUrl(e.to_string());

        match cursor {
            None => validate_url(&source.endpoint.replace(CURSOR_PLACEHOLDER, "")).map_err(invalid),
            Some(cursor) if source.endpoint.contains(CURSOR_PLACEHOLDER) => {
                validate_url(&source.endpoint.replace(CURSOR_PLACEHOLDER, cursor)).map_err(invalid)
            }
            Some(cursor) => {
                let base = validate_url(&source.endpoint).map_err(invalid)?;
                let joined = base
                    .join(cursor)
                    .map_err(|e| FetchError::InvalidUrl(format!("{cursor}: {e}")))?;
                validate_url(joined.as_str()).map_err(invalid)
            }
        }
    }

    /// Fetch one page, retrying transient failures with exponential backoff
    /// (`backoff_base * 2^attempt`).
    ///
    /// # Errors
    ///
    /// - [`FetchError::HttpStatus`] - 4xx fails immediately; 5xx after retries
    /// - [`FetchError::RateLimited`] - 429 persisted past `max_retries`
    /// - [`FetchError::ResponseTooLarge`] - body exceeded 10MB
    /// - [`FetchError::Cancelled`] - cancellation raced the request or a backoff sleep
    pub async fn fetch(&self, url: &Url, cancel: &Cancellation) -> Result<Vec<u8>, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                r = tokio::time::timeout(self.timeout, self.fetch_once(url)) => {
                    r.unwrap_or(Err(FetchError::Timeout))
                }
            };

            let err = match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) => e,
            };

            if err.kind() == ErrorKind::Permanent {
                return Err(err);
            }

            if attempt >= self.max_retries {
                return match err {
                    FetchError::HttpStatus(429) => Err(FetchError::RateLimited(self.max_retries)),
                    other => Err(other),
                };
            }

            let delay = self.backoff_base.saturating_mul(2u32.saturating_pow(attempt));
            tracing::warn!(
                url = %url,
                error = %err,
                retry = attempt,
                delay_ms = delay.as_millis() as u64,
                "Transient fetch failure, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        read_limited_bytes(response, MAX_PAGE_SIZE).await
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // A connection dropped mid-body can end the stream early without an error
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Ruleset;
    use crate::scrape::cancellation;
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_fetcher() -> Fetcher {
        Fetcher::new(&FetchConfig {
            backoff_base_ms: 1,
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    fn source(endpoint: &str) -> Source {
        Source {
            id: "test".to_string(),
            endpoint: endpoint.to_string(),
            ruleset: Ruleset::LwnText,
            category: None,
            max_pages: 1,
            probe_access: false,
        }
    }

    fn first_page(src: &Source) -> Url {
        Fetcher::page_url(src, None).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/headlines"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&mock_server)
            .await;

        let src = source(&format!("{}/headlines", mock_server.uri()));
        let url = Fetcher::page_url(&src, None).unwrap();
        assert_eq!(url.path(), "/headlines");
        let bytes = fast_fetcher()
            .fetch(&url, &Cancellation::never())
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_404_fails_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let src = source(&format!("{}/missing", mock_server.uri()));
        let err = fast_fetcher()
            .fetch(&first_page(&src), &Cancellation::never())
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let src = source(&format!("{}/feed", mock_server.uri()));
        let err = fast_fetcher()
            .fetch(&first_page(&src), &Cancellation::never())
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus(500) => {}
            e => panic!("Expected HttpStatus(500), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_429_exhaustion_is_rate_limited() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&mock_server)
            .await;

        let src = source(&format!("{}/feed", mock_server.uri()));
        let err = fast_fetcher()
            .fetch(&first_page(&src), &Cancellation::never())
            .await
            .unwrap_err();
        match err {
            FetchError::RateLimited(3) => {}
            e => panic!("Expected RateLimited(3), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        let mock_server = MockServer::start().await;

        // First two requests return 503, third succeeds
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;

        let src = source(&format!("{}/feed", mock_server.uri()));
        let bytes = fast_fetcher()
            .fetch(&first_page(&src), &Cancellation::never())
            .await
            .unwrap();
        assert_eq!(bytes, b"ok");
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let (handle, cancel) = cancellation();
        handle.cancel();

        let src = source(&format!("{}/feed", mock_server.uri()));
        let err = fast_fetcher().fetch(&first_page(&src), &cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_response() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&mock_server)
            .await;

        let (handle, cancel) = cancellation();
        let src = source(&format!("{}/feed", mock_server.uri()));
        let fetcher = fast_fetcher();

        let task = tokio::spawn(async move { fetcher.fetch(&first_page(&src), &cancel).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancellation should be prompt")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[test]
    fn test_page_url_resolution() {
        let templated = source("https://example.com/list?page={cursor}");
        assert_eq!(
            Fetcher::page_url(&templated, None).unwrap().as_str(),
            "https://example.com/list?page="
        );
        assert_eq!(
            Fetcher::page_url(&templated, Some("3")).unwrap().as_str(),
            "https://example.com/list?page=3"
        );

        let plain = source("https://example.com/news/");
        assert_eq!(
            Fetcher::page_url(&plain, Some("?offset=50")).unwrap().as_str(),
            "https://example.com/news/?offset=50"
        );
        assert_eq!(
            Fetcher::page_url(&plain, Some("https://example.com/news/page/2"))
                .unwrap()
                .as_str(),
            "https://example.com/news/page/2"
        );
        assert!(matches!(
            Fetcher::page_url(&plain, Some("ftp://example.com/x")),
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
