//! Polite HTTP access: robots.txt compliance, per-domain spacing, retry with backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use crate::content_hash;
use crate::robots::RobotsPolicy;

pub const DEFAULT_USER_AGENT: &str = "GrantScout/0.1 (+https://grantscout.example/about)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

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
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, max)`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Minimum spacing between requests to the same domain.
    pub default_delay: Duration,
    pub global_concurrency: usize,
    pub respect_robots: bool,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_delay: Duration::from_secs(2),
            global_concurrency: 8,
            respect_robots: true,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("access disallowed by robots.txt: {url}")]
    RobotsDisallowed { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Network {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
    /// SHA-256 of the response bytes, lowercase hex.
    pub content_hash: String,
}

#[derive(Debug)]
enum RobotsEntry {
    Missing,
    Policy(RobotsPolicy),
}

#[derive(Debug, Default)]
struct DomainState {
    robots: Option<RobotsEntry>,
    last_request: Option<Instant>,
}

impl DomainState {
    fn verdict(&self, user_agent: &str, path: &str) -> (bool, Option<Duration>) {
        match &self.robots {
            Some(RobotsEntry::Policy(policy)) => {
                (policy.is_allowed(user_agent, path), policy.crawl_delay(user_agent))
            }
            _ => (true, None),
        }
    }
}

/// Spacing required before the next request to a domain.
pub fn required_delay(crawl_delay: Option<Duration>, default_delay: Duration, floor: Duration) -> Duration {
    crawl_delay.unwrap_or(Duration::ZERO).max(default_delay).max(floor)
}

/// Domain key used for robots and spacing state: host plus explicit port.
pub fn domain_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

fn parse_http_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().map_or(true, str::is_empty) {
        return Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "expected an http(s) URL with a host".to_string(),
        });
    }
    Ok(url)
}

fn robots_path(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Shared HTTP client. Safe to use from many source workers at once: robots
/// and spacing state are held per domain behind an async lock, so requests to
/// one domain are serialised while different domains proceed in parallel.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
    default_delay: Duration,
    respect_robots: bool,
    global_limit: Arc<Semaphore>,
    domains: Mutex<HashMap<String, Arc<Mutex<DomainState>>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            user_agent: config.user_agent,
            default_delay: config.default_delay,
            respect_robots: config.respect_robots,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            domains: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    async fn domain_state(&self, key: &str) -> Arc<Mutex<DomainState>> {
        let mut map = self.domains.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DomainState::default())))
            .clone()
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_with_delay(url, Duration::ZERO).await
    }

    /// Fetch with an extra per-call spacing floor (a source's configured rate limit).
    pub async fn fetch_with_delay(&self, url: &str, floor: Duration) -> Result<FetchedPage, FetchError> {
        let parsed = parse_http_url(url)?;
        let key = domain_key(&parsed);
        let domain = self.domain_state(&key).await;

        // Held until the request completes so spacing is measured between
        // completed requests even when several workers share a domain.
        let mut state = domain.lock().await;
        if state.robots.is_none() {
            state.robots = Some(self.load_robots(&parsed).await);
        }

        let (allowed, crawl_delay) = state.verdict(&self.user_agent, &robots_path(&parsed));
        if self.respect_robots && !allowed {
            return Err(FetchError::RobotsDisallowed { url: url.to_string() });
        }

        let delay = required_delay(crawl_delay, self.default_delay, floor);
        if let Some(last) = state.last_request {
            let elapsed = last.elapsed();
            if elapsed < delay {
                let wait = delay - elapsed;
                debug!(domain = %key, wait_ms = wait.as_millis() as u64, "rate limiting");
                tokio::time::sleep(wait).await;
            }
        }

        let span = info_span!("http_fetch", url);
        let result = self.request_with_retry(url).instrument(span).await;
        state.last_request = Some(Instant::now());
        result
    }

    /// Robots check without fetching the page itself. Loads and caches the policy.
    pub async fn is_allowed(&self, url: &str) -> Result<bool, FetchError> {
        let parsed = parse_http_url(url)?;
        let domain = self.domain_state(&domain_key(&parsed)).await;
        let mut state = domain.lock().await;
        if state.robots.is_none() {
            state.robots = Some(self.load_robots(&parsed).await);
        }
        Ok(!self.respect_robots || state.verdict(&self.user_agent, &robots_path(&parsed)).0)
    }

    /// Effective spacing for a URL's domain: `max(crawl-delay, default delay)`.
    pub async fn crawl_delay(&self, url: &str) -> Result<Duration, FetchError> {
        let parsed = parse_http_url(url)?;
        let domain = self.domain_state(&domain_key(&parsed)).await;
        let mut state = domain.lock().await;
        if state.robots.is_none() {
            state.robots = Some(self.load_robots(&parsed).await);
        }
        let (_, crawl_delay) = state.verdict(&self.user_agent, "/");
        Ok(required_delay(crawl_delay, self.default_delay, Duration::ZERO))
    }

    async fn load_robots(&self, url: &Url) -> RobotsEntry {
        let robots_url = format!("{}://{}/robots.txt", url.scheme(), domain_key(url));
        let _permit = self.global_limit.acquire().await.ok();

        match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(text) => {
                    debug!(%robots_url, "loaded robots.txt");
                    RobotsEntry::Policy(RobotsPolicy::parse(&text))
                }
                Err(err) => {
                    debug!(%robots_url, error = %err, "unreadable robots.txt body");
                    RobotsEntry::Missing
                }
            },
            Ok(resp)
                if resp.status() == StatusCode::UNAUTHORIZED
                    || resp.status() == StatusCode::FORBIDDEN =>
            {
                warn!(%robots_url, status = resp.status().as_u16(), "robots.txt access denied; treating site as disallowed");
                RobotsEntry::Policy(RobotsPolicy::disallow_all())
            }
            Ok(resp) => {
                debug!(%robots_url, status = resp.status().as_u16(), "no robots.txt");
                RobotsEntry::Missing
            }
            Err(err) => {
                debug!(%robots_url, error = %err, "could not load robots.txt");
                RobotsEntry::Missing
            }
        }
    }

    async fn request_with_retry(&self, url: &str) -> Result<FetchedPage, FetchError> {
        // The semaphore is never closed, so acquire only fails if that changes.
        let _permit = self.global_limit.acquire().await.ok();

        let mut attempt = 0usize;
        loop {
            let outcome = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(bytes) => {
                                let page = FetchedPage {
                                    url: url.to_string(),
                                    final_url,
                                    status: status.as_u16(),
                                    content_hash: content_hash(&bytes),
                                    body: String::from_utf8_lossy(&bytes).into_owned(),
                                };
                                info!(url, bytes = bytes.len(), "fetched");
                                return Ok(page);
                            }
                            Err(err) => Err(err),
                        }
                    } else if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        Ok(status)
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(status) => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(url, status = status.as_u16(), attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "retryable status");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(url, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "request failed, retrying");
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(FetchError::Network {
                            url: url.to_string(),
                            attempts: attempt + 1,
                            source: err,
                        });
                    }
                }
            }
            attempt += 1;
        }
    }
}
