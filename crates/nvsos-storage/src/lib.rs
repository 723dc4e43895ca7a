//! Artifact storage + HTTP transport utilities for Nevada entity scrapes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use nvsos_core::{ScrapeRequest, ScrapeResult};
use reqwest::header::USER_AGENT;
use reqwest::{RequestBuilder, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nvsos-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Writes the per-run artifacts into one flat output directory.
///
/// File names are derived from the request id and file number, so concurrent
/// runs with distinct request ids never touch the same path.
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
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn result_path(&self, request: &ScrapeRequest) -> PathBuf {
        self.root.join(request.result_file_name())
    }

    pub fn snapshot_path(&self, request: &ScrapeRequest) -> PathBuf {
        self.root.join(request.snapshot_file_name())
    }

    /// Raw HTML of the last portal page seen by the run.
    pub async fn write_snapshot(
        &self,
        request: &ScrapeRequest,
        html: &str,
    ) -> anyhow::Result<StoredArtifact> {
        self.write_atomic(&request.snapshot_file_name(), html.as_bytes())
            .await
    }

    /// Serializes the run result as pretty-printed UTF-8 JSON.
    pub async fn write_result(
        &self,
        request: &ScrapeRequest,
        result: &ScrapeResult,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(result).context("serializing scrape result")?;
        self.write_atomic(&request.result_file_name(), &bytes).await
    }

    /// Write bytes through a temp file and rename, so readers never see a torn file.
    async fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating output directory {}", self.root.display()))?;

        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(path = %absolute_path.display(), bytes = bytes.len(), "artifact written");
        Ok(StoredArtifact {
            content_hash,
            file_name: file_name.to_string(),
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// One cookie jar per instance: build a new fetcher for every portal session.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            user_agent: config.user_agent,
        })
    }

    /// Pin the user agent for every later request of this fetcher.
    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) {
        self.user_agent = Some(user_agent.into());
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url);
        self.send(request, "GET", url).await
    }

    pub async fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).form(fields);
        self.send(request, "POST", url).await
    }

    async fn send(
        &self,
        request: RequestBuilder,
        method: &'static str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let request = match &self.user_agent {
            Some(user_agent) => request.header(USER_AGENT, user_agent.as_str()),
            None => request,
        };

        let span = info_span!("http_fetch", method, url);
        async move {
            let resp = request.send().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Request {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
