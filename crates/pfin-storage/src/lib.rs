//! Raw response archive, rate-limited HTTP fetching, and PostgreSQL access for
//! the pfin ETL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod pg;
pub mod staging;

pub use pg::{quote_ident, PgStore, StorageError};
pub use staging::{StagingPlan, STAGING_TABLE};

pub const CRATE_NAME: &str = "pfin-storage";

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw feed responses.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        &self,
        fetched_at: DateTime<Utc>,
        feed_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(feed_id)
            .join(format!("{content_hash}.json"))
    }

    /// Writes `body` once per content hash; a repeated body is reported as deduplicated.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        feed_id: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedResponse> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = self.relative_path_for(fetched_at, feed_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedResponse {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: body.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        // write-then-rename so readers never observe a partial body
        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "moving {} into place at {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

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

/// Transport-level retry schedule for transient HTTP failures.
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Smooth limit of `calls` per minute with a burst of the same size.
    pub fn per_minute(calls: u32) -> Self {
        let calls = calls.max(1);
        Self {
            capacity: calls,
            refill_every: Duration::from_millis(60_000 / u64::from(calls)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_feed_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_feed_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let refill_ms = self.refill_every.as_millis();
            if refill_ms > 0 {
                let elapsed = state.last_refill.elapsed();
                let refills = (elapsed.as_millis() / refill_ms) as u32;
                if refills > 0 {
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill = Instant::now();
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self.refill_every;
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Shared HTTP client for all feeds: concurrency caps, optional token-bucket
/// rate limiting, and retry of transient transport failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_feed_limit: usize,
    per_feed: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<TokenBucket>>,
    backoff: BackoffPolicy,
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

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_feed_limit: config.per_feed_concurrency.max(1),
            per_feed: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(|c| Arc::new(TokenBucket::new(c))),
            backoff: config.backoff,
        })
    }

    async fn per_feed_semaphore(&self, feed_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_feed.lock().await;
        map.entry(feed_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_feed_limit)))
            .clone()
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        feed_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", %run_id, feed_id, url);
        self.send_with_retry(feed_id, || self.client.get(url).query(query))
            .instrument(span)
            .await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        feed_id: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", %run_id, feed_id, url);
        self.send_with_retry(feed_id, || self.client.post(url).json(body))
            .instrument(span)
            .await
    }

    async fn send_with_retry<F>(&self, feed_id: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_feed = self.per_feed_semaphore(feed_id).await;
        let _feed = per_feed.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = redact_query(resp.url());
                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| FetchError::Request(err.without_url()))?
                            .to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            fetched_at: Utc::now(),
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying transient status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}

/// Drops the query string so API keys never reach logs or error messages.
fn redact_query(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn archive_hash_is_sha256_hex() {
        assert_eq!(
            ArtifactStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_bodies_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-03-02T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .archive(fetched_at, "fmp-earnings", br#"[{"symbol":"AAPL"}]"#)
            .await
            .expect("first archive");
        let second = store
            .archive(fetched_at, "fmp-earnings", br#"[{"symbol":"AAPL"}]"#)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20260302").join("fmp-earnings")));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_config_spreads_calls_over_a_minute() {
        let config = TokenBucketConfig::per_minute(280);
        assert_eq!(config.capacity, 280);
        assert_eq!(config.refill_every, Duration::from_millis(214));
    }

    #[test]
    fn throttling_statuses_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn redaction_strips_api_keys() {
        let url = reqwest::Url::parse("https://example.test/stable/earnings?symbol=AAPL&apikey=secret")
            .unwrap();
        assert_eq!(redact_query(&url), "https://example.test/stable/earnings");
    }

    #[tokio::test]
    async fn token_bucket_allows_burst_up_to_capacity() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 3,
            refill_every: Duration::from_secs(60),
        });
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
