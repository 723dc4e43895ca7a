//! Client for the remote CAPTCHA solving service.
//!
//! The service speaks the `in.php` / `res.php` protocol: a challenge is
//! submitted once, then its result is polled until a token is ready, the
//! service reports an `ERROR_*` code, or the caller's timeout runs out.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nvsos_core::{CaptchaChallenge, CaptchaSolution, ChallengeKind, TokenWidget};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "nvsos-solver";

pub const DEFAULT_SUBMIT_URL: &str = "https://api.solvecaptcha.com/in.php";
pub const DEFAULT_RESULT_URL: &str = "https://api.solvecaptcha.com/res.php";

const NOT_READY: &str = "CAPCHA_NOT_READY";

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("no solution within {waited:?}")]
    Timeout { waited: Duration },
    #[error("solving service rejected the challenge: {code}")]
    Rejected { code: String },
    #[error("solving service unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("unexpected solving service response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for SolverError {
    fn from(err: reqwest::Error) -> Self {
        // Poll URLs carry the API key in their query string.
        SolverError::Transport(err.without_url())
    }
}

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Solve one challenge, giving up once `timeout` has elapsed.
    async fn solve(
        &self,
        challenge: &CaptchaChallenge,
        timeout: Duration,
    ) -> Result<CaptchaSolution, SolverError>;
}

#[derive(Clone)]
pub struct SolverConfig {
    pub api_key: String,
    pub submit_url: String,
    pub result_url: String,
    pub poll_interval: Duration,
    /// Per-request HTTP timeout, independent of the overall solve timeout.
    pub request_timeout: Duration,
}

impl SolverConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            submit_url: DEFAULT_SUBMIT_URL.to_string(),
            result_url: DEFAULT_RESULT_URL.to_string(),
            poll_interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for SolverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverConfig")
            .field("api_key", &"<redacted>")
            .field("submit_url", &self.submit_url)
            .field("result_url", &self.result_url)
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Envelope shared by `in.php` and `res.php` when called with `json=1`.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    request: Value,
    #[serde(default)]
    useragent: Option<String>,
}

impl ApiResponse {
    fn request_text(&self) -> Option<String> {
        match &self.request {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveCaptchaClient {
    config: SolverConfig,
    client: reqwest::Client,
}

impl SolveCaptchaClient {
    pub fn new(config: SolverConfig) -> Result<Self, SolverError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn submit_form(&self, challenge: &CaptchaChallenge) -> Vec<(&'static str, String)> {
        let mut form = vec![("key", self.config.api_key.clone()), ("json", "1".to_string())];
        match challenge.kind {
            ChallengeKind::Token {
                widget: TokenWidget::HCaptcha,
            } => {
                form.push(("method", "hcaptcha".to_string()));
                form.push(("sitekey", challenge.payload.clone()));
                form.push(("pageurl", challenge.page_url.clone()));
            }
            ChallengeKind::Token {
                widget: TokenWidget::ReCaptcha,
            } => {
                form.push(("method", "userrecaptcha".to_string()));
                form.push(("googlekey", challenge.payload.clone()));
                form.push(("pageurl", challenge.page_url.clone()));
            }
            ChallengeKind::Image => {
                form.push(("method", "base64".to_string()));
                form.push(("body", challenge.payload.clone()));
            }
        }
        form
    }

    async fn submit(&self, challenge: &CaptchaChallenge) -> Result<String, SolverError> {
        let response: ApiResponse = self
            .client
            .post(&self.config.submit_url)
            .form(&self.submit_form(challenge))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let request = response.request_text().unwrap_or_default();
        if response.status == 1 && !request.is_empty() {
            Ok(request)
        } else if request.starts_with("ERROR") || request.starts_with("IP_BANNED") {
            Err(SolverError::Rejected { code: request })
        } else {
            Err(SolverError::Malformed(format!(
                "submit returned status {} without a task id",
                response.status
            )))
        }
    }

    async fn poll(&self, task_id: &str) -> Result<Option<CaptchaSolution>, SolverError> {
        let response: ApiResponse = self
            .client
            .get(&self.config.result_url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("action", "get"),
                ("id", task_id),
                ("json", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let request = response.request_text().unwrap_or_default();
        if response.status == 1 && !request.is_empty() {
            return Ok(Some(CaptchaSolution {
                token: request,
                solved_at: Utc::now(),
                user_agent: response.useragent,
            }));
        }
        if request == NOT_READY {
            return Ok(None);
        }
        if request.starts_with("ERROR") {
            return Err(SolverError::Rejected { code: request });
        }
        Err(SolverError::Malformed(format!(
            "result returned status {} with {:?}",
            response.status, response.request
        )))
    }
}

#[async_trait]
impl CaptchaSolver for SolveCaptchaClient {
    async fn solve(
        &self,
        challenge: &CaptchaChallenge,
        timeout: Duration,
    ) -> Result<CaptchaSolution, SolverError> {
        let started = Instant::now();
        let deadline = started + timeout;

        let task_id = tokio::time::timeout(timeout, self.submit(challenge))
            .await
            .map_err(|_| SolverError::Timeout { waited: timeout })??;
        info!(%task_id, kind = ?challenge.kind, "challenge submitted to solving service");

        let mut polls = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(%task_id, polls, "solving service timed out");
                return Err(SolverError::Timeout {
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }
            polls += 1;
            match tokio::time::timeout(remaining, self.poll(&task_id)).await {
                Ok(Ok(Some(solution))) => {
                    info!(%task_id, polls, elapsed = ?started.elapsed(), "challenge solved");
                    return Ok(solution);
                }
                Ok(Ok(None)) => debug!(%task_id, polls, "solution not ready"),
                Ok(Err(SolverError::Transport(err))) => {
                    warn!(%task_id, polls, error = %err, "poll failed, will retry");
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => continue,
            }
        }
    }
}
