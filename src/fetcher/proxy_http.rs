//! HTTP client for the scraping proxy
//!
//! Each page is one `POST` with basic auth and a JSON payload naming the search source, the
//! keyword and the page. The proxy wraps the target site's response in an envelope; the status
//! the proxy saw from the target site takes precedence over the proxy's own `200`.
//!
//! Organic results usually carry only title, url and price. Site-relative urls are made
//! absolute and the catalog number is taken from the url when the result has none.

use super::rate_limit::Channel;
use super::shared_resources::{build_http_client, global_http_client, DEFAULT_CONNECT_TIMEOUT};
use super::{ContinuationSignal, FetcherError, FetcherResult, PageFetcher, PageResponse};
use crate::validator::item_id_from_url;
use crate::RawListing;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default proxy endpoint
pub const DEFAULT_PROXY_URL: &str = "https://realtime.oxylabs.io/v1/queries";

/// Search source understood by the proxy
pub const SEARCH_SOURCE: &str = "target_search";

/// Origin that site-relative listing urls are resolved against
pub const SITE_ORIGIN: &str = "https://www.target.com";

/// Longest body excerpt kept in error messages
const MAX_BODY_EXCERPT: usize = 512;

/// Connection settings for the scraping proxy
#[derive(Clone)]
pub struct ProxyConfig {
    /// Endpoint accepting search queries
    pub base_url: String,
    /// Basic auth user
    pub username: String,
    /// Basic auth password
    pub password: String,
    /// Geo location the proxy should search from
    pub geo_location: String,
    /// User agent profile (`desktop`, `mobile`)
    pub user_agent_type: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Timeout for establishing a connection to the proxy
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    /// Config with default geo location and user agent, a 120 second request timeout and a
    /// 10 second connect timeout.
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            geo_location: "United States".to_string(),
            user_agent_type: "desktop".to_string(),
            request_timeout: Duration::from_secs(120),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the geo location.
    pub fn with_geo_location(mut self, geo_location: impl Into<String>) -> Self {
        self.geo_location = geo_location.into();
        self
    }

    fn validate(&self) -> FetcherResult<()> {
        let parsed = url::Url::parse(&self.base_url)
            .map_err(|e| FetcherError::Validation(format!("invalid proxy url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetcherError::Validation(format!(
                "proxy url must be http(s): {}",
                self.base_url
            )));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(FetcherError::Validation(
                "proxy timeouts must be positive".to_string(),
            ));
        }
        if self.username.trim().is_empty() || self.password.is_empty() {
            return Err(FetcherError::Validation(
                "proxy credentials are missing".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("geo_location", &self.geo_location)
            .field("user_agent_type", &self.user_agent_type)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Request body sent to the proxy
#[derive(Debug, Serialize)]
struct SearchPayload<'a> {
    source: &'static str,
    query: &'a str,
    start_page: u32,
    pages: u32,
    parse: bool,
    geo_location: &'a str,
    render: &'static str,
    user_agent_type: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ProxyEnvelope {
    #[serde(default)]
    results: Vec<ProxyResult>,
}

#[derive(Debug, Deserialize)]
struct ProxyResult {
    #[serde(default)]
    content: ProxyContent,
    #[serde(default)]
    status_code: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct ProxyContent {
    #[serde(default)]
    results: ContentResults,
    #[serde(default)]
    last_visible_page: Option<u32>,
    #[serde(default)]
    has_next_page: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentResults {
    #[serde(default)]
    organic: Vec<RawListing>,
}

/// [`PageFetcher`] backed by the scraping proxy
pub struct ProxyHttpClient {
    client: Arc<Client>,
    config: ProxyConfig,
}

impl ProxyHttpClient {
    /// Create a client on the shared connection pool, or on a dedicated one when the config
    /// asks for a different connect timeout.
    pub fn new(config: ProxyConfig) -> FetcherResult<Self> {
        if config.connect_timeout == DEFAULT_CONNECT_TIMEOUT {
            return Self::with_client(global_http_client(), config);
        }
        config.validate()?;
        let client = build_http_client(config.connect_timeout)
            .map_err(|e| FetcherError::Validation(format!("cannot build http client: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    /// Create a client on a caller-provided connection pool.
    pub fn with_client(client: Arc<Client>, config: ProxyConfig) -> FetcherResult<Self> {
        config.validate()?;
        Ok(Self { client, config })
    }

    /// Active configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

#[async_trait]
impl PageFetcher for ProxyHttpClient {
    async fn fetch_page(
        &self,
        keyword: &str,
        page_index: u32,
        channel: Channel,
    ) -> FetcherResult<PageResponse> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(FetcherError::Validation("keyword is empty".to_string()));
        }
        if page_index == 0 {
            return Err(FetcherError::Validation("pages are 1-based".to_string()));
        }

        let payload = SearchPayload {
            source: SEARCH_SOURCE,
            query: keyword,
            start_page: page_index,
            pages: 1,
            parse: true,
            geo_location: &self.config.geo_location,
            render: "html",
            user_agent_type: &self.config.user_agent_type,
        };

        debug!(keyword = %keyword, page = page_index, channel = %channel, "POST {}", self.config.base_url);

        let response = self
            .client
            .post(&self.config.base_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .timeout(self.config.request_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = parse_retry_after(response.headers(), Utc::now());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &body));
        }

        let body = response.text().await.map_err(map_transport_error)?;
        parse_envelope(&body, status)
    }

    fn name(&self) -> &str {
        "proxy"
    }
}

fn map_transport_error(err: reqwest::Error) -> FetcherError {
    if err.is_decode() {
        return FetcherError::MalformedResponse(err.to_string());
    }
    FetcherError::TransientNetwork {
        message: err.to_string(),
        timeout: err.is_timeout(),
    }
}

/// Map an error status to the request-level taxonomy.
pub fn status_error(status: u16, retry_after: Option<Duration>, body: &str) -> FetcherError {
    if status == 429 {
        return FetcherError::UpstreamRateLimited { retry_after };
    }
    let mut message: String = body.chars().take(MAX_BODY_EXCERPT).collect();
    if message.trim().is_empty() {
        message = "no response body".to_string();
    }
    FetcherError::UpstreamStatus { status, message }
}

/// Parse `Retry-After` given either as delta-seconds or as an HTTP-date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Decode a proxy envelope into a page.
pub fn parse_envelope(body: &str, http_status: u16) -> FetcherResult<PageResponse> {
    let envelope: ProxyEnvelope = serde_json::from_str(body)
        .map_err(|e| FetcherError::MalformedResponse(format!("invalid proxy envelope: {e}")))?;

    let Some(result) = envelope.results.into_iter().next() else {
        return Ok(PageResponse {
            records: Vec::new(),
            continuation: None,
            http_status,
        });
    };

    if let Some(inner) = result.status_code {
        if !(200..300).contains(&inner) {
            return Err(status_error(inner, None, "target site error relayed by proxy"));
        }
    }

    let content = result.content;
    let continuation = match (content.last_visible_page, content.has_next_page) {
        (Some(total), _) => Some(ContinuationSignal::TotalPages(total)),
        (None, Some(more)) => Some(ContinuationSignal::HasMore(more)),
        (None, None) => None,
    };

    let records = content
        .results
        .organic
        .into_iter()
        .map(complete_listing)
        .collect();

    Ok(PageResponse {
        records,
        continuation,
        http_status: result.status_code.unwrap_or(http_status),
    })
}

/// Absolute url, and item id derived from the url when the proxy left it out.
fn complete_listing(mut listing: RawListing) -> RawListing {
    if let Some(url) = listing.url.as_mut() {
        if url.starts_with('/') {
            *url = format!("{SITE_ORIGIN}{url}");
        }
    }
    let has_id = listing
        .item_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty());
    if !has_id {
        listing.item_id = listing.url.as_deref().and_then(item_id_from_url);
    }
    listing
}
