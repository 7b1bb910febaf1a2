//! Image storage, HTTP fetch utilities and outbound-request safety for gamefeed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gamefeed_core::Image;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod guard;
mod images;

pub use guard::{is_non_public_ip, is_unsafe_target, PrivateNetworkGuard, TargetGuard};
pub use images::{
    extract_image_links, GoogleCustomSearch, ImageDownload, ImageResolver, ImageSearch,
    NoImageSearch,
};

pub const CRATE_NAME: &str = "gamefeed-storage";

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

impl StoredImage {
    /// Identifier handed back to the record store: the path relative to the store root.
    pub fn image_id(&self) -> String {
        self.relative_path.to_string_lossy().replace('\\', "/")
    }
}

/// Content-addressed on-disk image storage, one directory per record.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_relative_path(&self, record_id: i64, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(record_id.to_string()).join(format!("{content_hash}.{ext}"))
    }

    /// Store image bytes under a hash-addressed path using an atomic temp-file rename.
    pub async fn store_image(&self, record_id: i64, image: &Image) -> anyhow::Result<StoredImage> {
        let content_hash = image.sha256_hex();
        let relative_path = self.image_relative_path(record_id, &content_hash, image.extension());
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating image directory {}", parent.display()))?;

        let stored = |deduplicated| StoredImage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: image.byte_len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking image path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), image.byte_len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp image file {}", temp_path.display()))?;
        file.write_all(&image.bytes)
            .await
            .with_context(|| format!("writing temp image file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp image file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp image {} -> {}",
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Redirect hops followed before a fetch is abandoned.
pub const MAX_REDIRECTS: usize = 10;

/// Idle per-host semaphores are dropped once the map reaches this size.
const PER_HOST_PRUNE_AT: usize = 256;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub max_body_bytes: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            max_body_bytes: 10 * 1024 * 1024,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared outbound HTTP client: bounded timeout, concurrency limits, retry with backoff.
///
/// Redirects are followed by hand so that every hop can be checked against the
/// redirect guard, when one is set.
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_body_bytes: usize,
    redirect_guard: Option<Arc<dyn TargetGuard>>,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("per_host_limit", &self.per_host_limit)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("redirect_guard", &self.redirect_guard.is_some())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("refusing to fetch private network target {0}")]
    UnsafeTarget(String),
    #[error("more than {MAX_REDIRECTS} redirects starting at {0}")]
    TooManyRedirects(String),
    #[error("response body from {url} exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            max_body_bytes: config.max_body_bytes,
            redirect_guard: None,
            backoff: config.backoff,
        })
    }

    /// Refuses redirect hops that `guard` flags. The first URL is the caller's to check.
    pub fn with_redirect_guard(mut self, guard: Arc<dyn TargetGuard>) -> Self {
        self.redirect_guard = Some(guard);
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        if map.len() >= PER_HOST_PRUNE_AT && !map.contains_key(host) {
            // Only the map holds an idle entry's Arc.
            map.retain(|_, sem| Arc::strong_count(sem) > 1);
        }
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch(url, None, &[]).await
    }

    /// Like `fetch_bytes` with a per-request timeout overriding the client default.
    pub async fn fetch_bytes_within(
        &self,
        url: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch(url, Some(timeout), headers).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }

    async fn fetch(
        &self,
        url: &str,
        timeout: Option<Duration>,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut current = url.to_string();
        let mut hops = 0;
        loop {
            let resp = self.send_to_host(&current, timeout, headers).await?;
            let status = resp.status();

            if status.is_redirection() {
                let Some(next) = redirect_location(&current, &resp) else {
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: current,
                    });
                };
                if hops >= MAX_REDIRECTS {
                    return Err(FetchError::TooManyRedirects(url.to_string()));
                }
                if self.hop_is_unsafe(&next).await {
                    warn!(from = %current, to = %next, "refusing redirect to private network target");
                    return Err(FetchError::UnsafeTarget(next));
                }
                debug!(from = %current, to = %next, "following redirect");
                hops += 1;
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: current,
                });
            }

            let body = read_capped(resp, &current, self.max_body_bytes).await?;
            return Ok(FetchedResponse {
                status,
                final_url: current,
                body,
            });
        }
    }

    async fn hop_is_unsafe(&self, url: &str) -> bool {
        let Some(guard) = &self.redirect_guard else {
            return false;
        };
        let guard = Arc::clone(guard);
        let uri = url.to_string();
        tokio::task::spawn_blocking(move || guard.is_unsafe(&uri))
            .await
            .unwrap_or(true)
    }

    async fn send_to_host(
        &self,
        url: &str,
        timeout: Option<Duration>,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, FetchError> {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        // Semaphores are never closed, acquire cannot fail.
        let _global = self.global_limit.clone().acquire_owned().await.ok();
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire_owned().await.ok();

        let span = info_span!("http_fetch", url, host = %host);
        self.send_with_retries(url, timeout, headers).instrument(span).await
    }

    /// Sends until a non-retryable answer arrives. Redirects come back unfollowed.
    async fn send_with_retries(
        &self,
        url: &str,
        timeout: Option<Duration>,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn redirect_location(current: &str, resp: &reqwest::Response) -> Option<String> {
    let location = resp.headers().get(reqwest::header::LOCATION)?.to_str().ok()?;
    let next = url::Url::parse(current).ok()?.join(location).ok()?;
    matches!(next.scheme(), "http" | "https").then(|| next.to_string())
}

async fn read_capped(mut resp: reqwest::Response, url: &str, limit: usize) -> Result<Vec<u8>, FetchError> {
    let too_large = || FetchError::BodyTooLarge {
        url: url.to_string(),
        limit,
    };
    if resp.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
