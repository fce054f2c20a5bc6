//! Rate-limited HTTP fetching with bounded retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Everything needed to issue a request and to fingerprint it for caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Stable hash of method, sorted query parameters and body digest.
    ///
    /// Headers and the URL are not part of the fingerprint; the URL is paired
    /// with it to form the cache key.
    pub fn fingerprint(&self) -> String {
        let mut params = self.query.clone();
        params.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.method.trim().to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        for (key, value) in &params {
            // length-prefixed: distinct parameter lists never share an encoding
            hasher.update(format!("{}:{}={}:{}\n", key.len(), key, value.len(), value).as_bytes());
        }
        hasher.update(b"\n");
        match &self.body {
            Some(body) => hasher.update(sha256_hex(body).as_bytes()),
            None => hasher.update(b"-"),
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub headers: BTreeMap<String, String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("malformed response body from {url}: {reason}")]
    MalformedBody { url: String, reason: String },
}

impl FetchError {
    /// Timeouts, connect failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(status)
            }
            Self::InvalidRequest(_) | Self::Unavailable(_) | Self::MalformedBody { .. } => false,
        }
    }
}

/// Seam between the collector and the network.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<FetchedResponse, FetchError>;
}

/// Exponential delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry`, counting from zero.
    pub fn delay_before(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|r| 2u32.checked_pow(r))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub retry: RetryPolicy,
    /// Minimum gap between request starts. Zero disables pacing.
    pub request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            retry: RetryPolicy::default(),
            request_interval: Duration::ZERO,
        }
    }
}

/// Hands out request start slots at least `interval` apart, shared by all callers.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserve the next free slot, then sleep until it arrives.
    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |at| at.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacer = (!config.request_interval.is_zero())
            .then(|| RequestPacer::new(config.request_interval));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            pacer,
            retry: config.retry,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    fn build_request(
        &self,
        method: &Method,
        request: &RequestDescriptor,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
    }

    async fn send_with_retries(
        &self,
        method: Method,
        request: &RequestDescriptor,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            match self.send_once(&method, request).await {
                Err(err) if err.is_retryable() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay_before(retry);
                    debug!(retry, ?delay, error = %err, "retrying fetch");
                    retry += 1;
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// One paced attempt. Non-2xx statuses come back as `HttpStatus` errors.
    async fn send_once(
        &self,
        method: &Method,
        request: &RequestDescriptor,
    ) -> Result<FetchedResponse, FetchError> {
        if let Some(pacer) = &self.pacer {
            pacer.wait_turn().await;
        }

        let resp = self.build_request(method, request).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect::<BTreeMap<_, _>>();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status: status.as_u16(),
            final_url,
            headers,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<FetchedResponse, FetchError> {
        let method = Method::from_bytes(request.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("bad method {}", request.method)))?;
        let host = reqwest::Url::parse(&request.url)
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {e}", request.url)))?
            .host_str()
            .unwrap_or_default()
            .to_string();

        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %host, url = %request.url);
        self.send_with_retries(method, request).instrument(span).await
    }
}
