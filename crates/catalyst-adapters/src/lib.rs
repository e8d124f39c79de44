//! HTTP clients for the services prioritization depends on: the HIAP
//! prioritizer and the Global API city-context endpoints.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub mod global_api;
pub mod hiap;

pub use global_api::{CityContext, CityContextSource, GlobalApiClient};
pub use hiap::{
    BulkPrioritizationRequest, BulkPrioritizationResult, CityData, CityEmissions,
    CityPrioritization, CityRequest, Explanation, HiapClient, PrioritizationMetadata,
    PrioritizerApi, RankedItem, TaskProgress, TaskStatus,
};

pub const CRATE_NAME: &str = "catalyst-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
    #[error("http client is shutting down")]
    Closed,
}

impl AdapterError {
    /// Whether a later attempt against the same upstream may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Request(_) | AdapterError::Closed => true,
            AdapterError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == Attempt::Retry)
                .unwrap_or(false),
            AdapterError::Decode { .. } | AdapterError::Upstream(_) | AdapterError::InvalidConfig(_) => {
                false
            }
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Retry,
    GiveUp,
}

/// Upstream overload, throttling and gateway timeouts are worth another try.
pub fn classify_status(status: StatusCode) -> Attempt {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Attempt::Retry,
        s if s.is_server_error() => Attempt::Retry,
        _ => Attempt::GiveUp,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> Attempt {
    if err.is_timeout() || err.is_connect() {
        Attempt::Retry
    } else {
        Attempt::GiveUp
    }
}

/// Doubling delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_after(&self, retries_so_far: usize) -> Duration {
        let doublings = u32::try_from(retries_so_far).unwrap_or(u32::MAX).min(16);
        self.base_delay
            .checked_mul(2u32.pow(doublings))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("catalyst/{}", env!("CARGO_PKG_VERSION"))),
            concurrency: 8,
            backoff: BackoffPolicy::default(),
            default_headers: Vec::new(),
        }
    }
}

/// JSON-over-HTTP client with bounded concurrency and retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, AdapterError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AdapterError::InvalidConfig(format!("header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AdapterError::InvalidConfig(format!("header value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, AdapterError> {
        let span = info_span!("http_get", %url);
        self.send_json(|| self.client.get(url.clone()), &url)
            .instrument(span)
            .await
    }

    pub async fn post_json<B, T>(&self, url: Url, body: &B) -> Result<T, AdapterError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let span = info_span!("http_post", %url);
        self.send_json(|| self.client.post(url.clone()).json(body), &url)
            .instrument(span)
            .await
    }

    async fn send_json<T, F>(&self, build: F, url: &Url) -> Result<T, AdapterError>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self.limit.acquire().await.map_err(|_| AdapterError::Closed)?;

        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        return serde_json::from_slice(&bytes).map_err(|source| AdapterError::Decode {
                            url: url.to_string(),
                            source,
                        });
                    }

                    if classify_status(status) == Attempt::Retry
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_after(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(AdapterError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == Attempt::Retry
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_after(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(AdapterError::Request(err));
                }
            }
        }
    }
}

/// Parse a service base URL so that path segments can be appended to it.
pub fn parse_base_url(base: &str) -> Result<Url, AdapterError> {
    let url = Url::parse(base).map_err(|e| AdapterError::InvalidConfig(format!("{base}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(AdapterError::InvalidConfig(format!("{base} cannot be a base url")));
    }
    Ok(url)
}

/// Append percent-encoded path segments to `base`.
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, AdapterError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AdapterError::InvalidConfig(format!("{base} cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
