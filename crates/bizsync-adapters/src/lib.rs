//! Search-provider contract plus the Yelp Fusion HTTP client and a
//! fixture-backed provider for offline runs.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bizsync_core::RawBusiness;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const DEFAULT_YELP_API_URL: &str = "https://api.yelp.com/v3/businesses/search";

const PLACEHOLDER_API_KEY: &str = "YOUR_YELP_API_KEY_HERE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub term: String,
    pub location: String,
    pub limit: u32,
    pub offset: u32,
}

/// One page of provider results: the provider-wide hit count plus raw records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchPage {
    pub total: u64,
    pub businesses: Vec<RawBusiness>,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("provider is not configured: {0}")]
    Configuration(String),
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned http {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("provider payload could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError>;
}

/// Retry budget for transient provider failures: throttling, 5xx, timeouts
/// and refused connections.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based), doubling up to `max_delay`.
    fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct YelpClientConfig {
    pub api_key: String,
    pub api_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound sent as `limit`, whatever the caller asks for.
    pub max_limit: u32,
    pub retry: RetryPolicy,
}

impl Default for YelpClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: DEFAULT_YELP_API_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_limit: 50,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct YelpClient {
    client: reqwest::Client,
    config: YelpClientConfig,
}

impl YelpClient {
    pub fn new(config: YelpClientConfig) -> Result<Self, UpstreamError> {
        let key = config.api_key.trim();
        if key.is_empty() || key == PLACEHOLDER_API_KEY {
            return Err(UpstreamError::Configuration(
                "YELP_API_KEY is missing or still set to the placeholder".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    fn query_params(&self, query: &SearchQuery) -> Vec<(&'static str, String)> {
        vec![
            ("term", query.term.clone()),
            ("location", query.location.clone()),
            ("limit", query.limit.min(self.config.max_limit).to_string()),
            ("offset", query.offset.to_string()),
            ("sort_by", "best_match".to_string()),
        ]
    }

    /// Throttling, 5xx, timeouts and refused connections are worth another try.
    fn is_transient(err: &UpstreamError) -> bool {
        match err {
            UpstreamError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::Request(err) => err.is_timeout() || err.is_connect(),
            UpstreamError::Configuration(_) | UpstreamError::Decode(_) => false,
        }
    }

    async fn request_once(
        &self,
        params: &[(&'static str, String)],
    ) -> Result<SearchPage, UpstreamError> {
        let resp = self
            .client
            .get(&self.config.api_url)
            .bearer_auth(self.config.api_key.trim())
            .query(params)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(UpstreamError::HttpStatus {
                status: status.as_u16(),
                message: provider_error_message(&body, status),
            });
        }
        decode_search_page(&body)
    }

    async fn fetch_page(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        let params = self.query_params(query);
        let mut retry = 0;
        loop {
            match self.request_once(&params).await {
                Err(err) if retry < self.config.retry.max_retries && Self::is_transient(&err) => {
                    let delay = self.config.retry.delay(retry);
                    warn!(error = %err, retry, ?delay, "retrying provider search");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl SearchProvider for YelpClient {
    fn provider_id(&self) -> &'static str {
        "yelp"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        let span = info_span!(
            "provider_search",
            provider = "yelp",
            term = %query.term,
            location = %query.location
        );
        let page = self.fetch_page(query).instrument(span).await?;
        debug!(
            total = page.total,
            returned = page.businesses.len(),
            "provider search finished"
        );
        Ok(page)
    }
}

pub fn decode_search_page(body: &[u8]) -> Result<SearchPage, UpstreamError> {
    serde_json::from_slice(body).map_err(|err| UpstreamError::Decode(err.to_string()))
}

/// Prefer the provider's `error.description` over a bare status line.
pub fn provider_error_message(body: &[u8], status: StatusCode) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/description")
                .and_then(|d| d.as_str())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| format!("provider search failed with status {}", status.as_u16()))
}

/// Serves a captured search page from disk, slicing it by `offset`/`limit`.
#[derive(Debug, Clone, Default)]
pub struct FixtureProvider {
    page: SearchPage,
}

impl FixtureProvider {
    pub fn new(page: SearchPage) -> Self {
        Self { page }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let page =
            decode_search_page(data.as_bytes()).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(page))
    }
}

#[async_trait]
impl SearchProvider for FixtureProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        let businesses = self
            .page
            .businesses
            .iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok(SearchPage {
            total: self.page.total.max(self.page.businesses.len() as u64),
            businesses,
        })
    }
}

/// Stands in for a provider whose credentials are missing; every search
/// fails with [`UpstreamError::Configuration`].
#[derive(Debug, Clone)]
pub struct UnconfiguredProvider {
    reason: String,
}

impl UnconfiguredProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SearchProvider for UnconfiguredProvider {
    fn provider_id(&self) -> &'static str {
        "unconfigured"
    }

    async fn search(&self, _query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        Err(UpstreamError::Configuration(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_path() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/yelp/sample_search.json")
    }

    #[test]
    fn retry_delay_doubles_until_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        let delays = (0..4).map(|retry| policy.delay(retry)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [100, 200, 350, 350].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.delay(64), Duration::from_millis(350));
    }

    #[test]
    fn only_throttling_and_server_errors_are_transient() {
        let status = |status| UpstreamError::HttpStatus {
            status,
            message: String::new(),
        };
        assert!(YelpClient::is_transient(&status(429)));
        assert!(YelpClient::is_transient(&status(503)));
        assert!(!YelpClient::is_transient(&status(400)));
        assert!(!YelpClient::is_transient(&status(401)));
        assert!(!YelpClient::is_transient(&UpstreamError::Decode("bad".into())));
    }

    #[test]
    fn provider_error_description_is_surfaced() {
        let body = br#"{"error": {"code": "VALIDATION_ERROR", "description": "location is required"}}"#;
        assert_eq!(
            provider_error_message(body, StatusCode::BAD_REQUEST),
            "location is required"
        );
        assert_eq!(
            provider_error_message(b"<html>", StatusCode::BAD_GATEWAY),
            "provider search failed with status 502"
        );
    }

    #[test]
    fn placeholder_key_is_rejected() {
        for api_key in ["", "  ", PLACEHOLDER_API_KEY] {
            let err = YelpClient::new(YelpClientConfig {
                api_key: api_key.to_string(),
                ..Default::default()
            })
            .expect_err("missing key");
            assert!(matches!(err, UpstreamError::Configuration(_)));
        }
    }

    #[test]
    fn query_limit_is_capped_by_config() {
        let client = YelpClient::new(YelpClientConfig {
            api_key: "test-key".into(),
            max_limit: 20,
            ..Default::default()
        })
        .expect("client");
        let params = client.query_params(&SearchQuery {
            term: "coffee".into(),
            location: "Paris".into(),
            limit: 500,
            offset: 40,
        });
        assert!(params.contains(&("limit", "20".to_string())));
        assert!(params.contains(&("offset", "40".to_string())));
        assert!(params.contains(&("sort_by", "best_match".to_string())));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        assert!(matches!(
            decode_search_page(b"{\"businesses\": 3}"),
            Err(UpstreamError::Decode(_))
        ));
        let empty = decode_search_page(b"{}").expect("empty page");
        assert_eq!(empty.total, 0);
        assert!(empty.businesses.is_empty());
    }

    #[tokio::test]
    async fn fixture_provider_pages_through_captured_results() {
        let provider = FixtureProvider::load(fixture_path()).expect("fixture");
        let first = provider
            .search(&SearchQuery {
                term: "coffee".into(),
                location: "Paris".into(),
                limit: 2,
                offset: 0,
            })
            .await
            .expect("search");
        assert_eq!(first.businesses.len(), 2);
        assert!(first.total >= 4);

        let rest = provider
            .search(&SearchQuery {
                term: "coffee".into(),
                location: "Paris".into(),
                limit: 50,
                offset: 2,
            })
            .await
            .expect("search");
        assert_eq!(
            rest.businesses.first().and_then(|b| b.id.clone()),
            Some("le-petit-four-paris".to_string())
        );
    }
}
