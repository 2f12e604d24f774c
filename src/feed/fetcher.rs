use crate::feed::parser::{parse_offers, Offer, ParseError, ParseResult};
use crate::util::RetryPolicy;
use futures::stream::{self, StreamExt};
use reqwest::header::{ETAG, LAST_MODIFIED};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Product exports for large catalogs run to tens of megabytes.
pub const MAX_FEED_SIZE: usize = 64 * 1024 * 1024; // 64MB

/// Some vendor hosts refuse non-browser agents.
pub const FEED_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.0.0 Safari/537.36";

/// Errors that can occur while fetching and parsing one feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed XML could not be parsed at all
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// The blocking parse task panicked or was cancelled
    #[error("Parse task failed: {0}")]
    ParseTask(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Knobs for a fetch run.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Prefix for derived offer codes.
    pub vendor_prefix: String,
    pub timeout: Duration,
    /// Maximum feeds in flight at once.
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    pub max_size: usize,
}

impl FetchOptions {
    pub fn new(vendor_prefix: impl Into<String>, timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            vendor_prefix: vendor_prefix.into(),
            timeout,
            max_concurrent,
            retry: RetryPolicy::default(),
            max_size: MAX_FEED_SIZE,
        }
    }
}

/// A successfully fetched and parsed feed.
#[derive(Debug)]
pub struct FetchedFeed {
    pub offers: Vec<Offer>,
    /// `ETag`, else `Last-Modified`, else SHA-256 of the body.
    pub fingerprint: String,
    /// Set when the XML broke partway and only a prefix of offers was read.
    pub parse_error: Option<String>,
}

/// Outcome of fetching one feed URL.
#[derive(Debug)]
pub struct FetchResult {
    pub url: Url,
    pub result: Result<FetchedFeed, FetchError>,
}

/// Builds the HTTP client used for feed downloads.
pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(FEED_USER_AGENT)
        .timeout(timeout)
        .build()
}

/// Fetches and parses all feeds with bounded concurrency.
///
/// At most `options.max_concurrent` requests are in flight. Results come
/// back in input order so callers can apply first-wins rules
/// deterministically. One feed failing never affects the others.
pub async fn fetch_all(
    client: &reqwest::Client,
    urls: &[Url],
    options: &FetchOptions,
) -> Vec<FetchResult> {
    if urls.is_empty() {
        return Vec::new();
    }

    stream::iter(urls.iter().cloned())
        .map(|url| async move {
            let result = fetch_one(client, &url, options).await;
            match &result {
                Ok(feed) => tracing::info!(
                    feed = %url,
                    offers = feed.offers.len(),
                    partial = feed.parse_error.is_some(),
                    "Feed fetched"
                ),
                Err(e) => tracing::warn!(feed = %url, error = %e, "Feed fetch failed"),
            }
            FetchResult { url, result }
        })
        .buffered(options.max_concurrent.max(1))
        .collect()
        .await
}

/// Fetches one feed and parses its offers.
///
/// # Errors
///
/// - [`FetchError::Network`] - Connection or TLS errors
/// - [`FetchError::Timeout`] - Request exceeded `options.timeout`
/// - [`FetchError::HttpStatus`] - Non-2xx HTTP response (5xx after retries)
/// - [`FetchError::RateLimited`] - 429 response after max retries
/// - [`FetchError::ResponseTooLarge`] - Response exceeded `options.max_size`
/// - [`FetchError::Parse`] - Malformed XML with no readable offers
pub async fn fetch_one(
    client: &reqwest::Client,
    url: &Url,
    options: &FetchOptions,
) -> Result<FetchedFeed, FetchError> {
    let retry = options.retry;
    let mut retry_count = 0;

    let (bytes, validator) = loop {
        let response = tokio::time::timeout(options.timeout, client.get(url.clone()).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if !retry.can_retry(retry_count) {
                return Err(FetchError::RateLimited(retry.max_retries));
            }

            let delay = retry.delay(retry_count);
            tracing::warn!(
                feed = %url,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Rate limited, backing off"
            );

            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        if response.status().is_server_error() {
            if !retry.can_retry(retry_count) {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            let delay = retry.delay(retry_count);
            tracing::warn!(
                feed = %url,
                status = %response.status(),
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Server error, retrying after delay"
            );

            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        // 4xx fail immediately
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let validator = cache_validator(&response);

        match read_limited_bytes(response, options.max_size).await {
            Ok(bytes) => break (bytes, validator),
            Err(FetchError::IncompleteResponse { expected, received }) => {
                if !retry.can_retry(retry_count) {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }

                let delay = retry.delay(retry_count);
                tracing::debug!(
                    feed = %url,
                    expected = expected,
                    received = received,
                    attempt = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying incomplete download"
                );

                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    let fingerprint = validator.unwrap_or_else(|| format!("{:x}", Sha256::digest(&bytes)));

    // Large catalogs take a while to parse; keep that off the async workers
    let prefix = options.vendor_prefix.clone();
    let ParseResult { offers, error } =
        tokio::task::spawn_blocking(move || parse_offers(&bytes, &prefix))
            .await
            .map_err(|e| FetchError::ParseTask(e.to_string()))??;

    if offers.is_empty() {
        tracing::warn!(feed = %url, "Feed contains no <offer> elements");
    }

    Ok(FetchedFeed {
        offers,
        fingerprint,
        parse_error: error,
    })
}

/// Reads the HTTP cache validator used as the change fingerprint.
fn cache_validator(response: &reqwest::Response) -> Option<String> {
    let headers = response.headers();
    [ETAG, LAST_MODIFIED]
        .iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_FEED: &str = r#"<?xml version="1.0"?>
<yml_catalog><shop><offers>
    <offer id="1"><vendorCode>A-1</vendorCode><price>10</price></offer>
</offers></shop></yml_catalog>"#;

    fn options() -> FetchOptions {
        FetchOptions {
            retry: RetryPolicy::new(3, Duration::from_millis(10)),
            ..FetchOptions::new("SHOP", Duration::from_secs(5), 4)
        }
    }

    fn feed_url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_FEED)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let feed = fetch_one(&client, &feed_url(&mock_server, "/feed"), &options())
            .await
            .unwrap();
        assert_eq!(feed.offers.len(), 1);
        assert_eq!(feed.offers[0].code, "SHOP_A-1");
        assert_eq!(
            feed.fingerprint,
            format!("{:x}", Sha256::digest(VALID_FEED.as_bytes()))
        );
        assert!(feed.parse_error.is_none());

        // The UA contains a comma, so compare the raw header instead of
        // using the value-splitting `header` matcher
        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].headers.get("user-agent").unwrap().to_str().unwrap(),
            FEED_USER_AGENT
        );
    }

    #[tokio::test]
    async fn test_etag_used_as_fingerprint() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_FEED)
                    .insert_header("ETag", "\"v42\""),
            )
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let feed = fetch_one(&client, &feed_url(&mock_server, "/feed"), &options())
            .await
            .unwrap();
        assert_eq!(feed.fingerprint, "\"v42\"");
    }

    #[tokio::test]
    async fn test_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let result = fetch_one(&client, &feed_url(&mock_server, "/feed"), &options()).await;
        match result.unwrap_err() {
            FetchError::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let result = fetch_one(&client, &feed_url(&mock_server, "/feed"), &options()).await;
        match result.unwrap_err() {
            FetchError::HttpStatus(500) => {}
            e => panic!("Expected HttpStatus(500), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        use wiremock::matchers::any;

        let mock_server = MockServer::start().await;

        // First two requests return 503, third succeeds
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_FEED))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let feed = fetch_one(&client, &feed_url(&mock_server, "/feed"), &options())
            .await
            .unwrap();
        assert_eq!(feed.offers.len(), 1);
    }

    #[tokio::test]
    async fn test_429_gives_up_as_rate_limited() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let result = fetch_one(&client, &feed_url(&mock_server, "/feed"), &options()).await;
        assert!(matches!(result, Err(FetchError::RateLimited(3))));
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<offers><offer id=\"1\""))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let result = fetch_one(&client, &feed_url(&mock_server, "/feed"), &options()).await;
        match result.unwrap_err() {
            FetchError::Parse(_) => {}
            e => panic!("Expected Parse error, got {:?}", e),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_large_catalogs_parse_concurrently() {
        let offers: String = (0..5_000)
            .map(|i| format!("<offer id=\"{i}\"><price>{i}</price></offer>"))
            .collect();
        let body = format!("<yml_catalog><shop><offers>{}</offers></shop></yml_catalog>", offers);

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let urls: Vec<Url> = (0..4)
            .map(|i| feed_url(&mock_server, &format!("/feed{}", i)))
            .collect();
        let results = fetch_all(&client, &urls, &options()).await;

        assert_eq!(results.len(), 4);
        for r in &results {
            let feed = r.result.as_ref().unwrap();
            assert_eq!(feed.offers.len(), 5_000);
            assert_eq!(feed.offers[4_999].code, "SHOP_4999");
        }
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2048)))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let opts = FetchOptions {
            max_size: 1024,
            ..options()
        };
        let result = fetch_one(&client, &feed_url(&mock_server, "/feed"), &opts).await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }

    #[tokio::test]
    async fn test_fetch_all_isolates_failures_and_keeps_order() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_FEED))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let urls = vec![
            feed_url(&mock_server, "/missing"),
            feed_url(&mock_server, "/good"),
        ];
        let client = reqwest::Client::new();
        let results = fetch_all(&client, &urls, &options()).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url.path(), "/missing");
        assert!(results[0].result.is_err());
        assert_eq!(results[1].url.path(), "/good");
        assert_eq!(results[1].result.as_ref().unwrap().offers.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_all_empty() {
        let client = reqwest::Client::new();
        assert!(fetch_all(&client, &[], &options()).await.is_empty());
    }
}
