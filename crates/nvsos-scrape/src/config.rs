use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nvsos_portal::{PortalConfig, DEFAULT_DETAIL_URL, DEFAULT_ENTRY_URL};
use nvsos_solver::{SolverConfig, DEFAULT_RESULT_URL, DEFAULT_SUBMIT_URL};
use nvsos_storage::{BackoffPolicy, HttpClientConfig};
use serde::Deserialize;

use crate::RunSettings;

pub const API_KEY_VAR: &str = "SOLVECAPTCHA_API_KEY";

/// Everything a run needs, resolved from the environment and an optional YAML file.
#[derive(Clone)]
pub struct ScrapeConfig {
    pub portal_url: String,
    pub detail_url: String,
    pub solver_api_key: Option<String>,
    pub solver_submit_url: String,
    pub solver_result_url: String,
    pub solver_poll_secs: u64,
    pub output_dir: PathBuf,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub network_retries: usize,
    pub max_challenge_rounds: u32,
    pub max_solver_attempts: u32,
    pub solver_timeout_secs: u64,
    pub run_budget_secs: u64,
    pub hard_cutoff_secs: u64,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            portal_url: DEFAULT_ENTRY_URL.to_string(),
            detail_url: DEFAULT_DETAIL_URL.to_string(),
            solver_api_key: None,
            solver_submit_url: DEFAULT_SUBMIT_URL.to_string(),
            solver_result_url: DEFAULT_RESULT_URL.to_string(),
            solver_poll_secs: 3,
            output_dir: PathBuf::from("."),
            user_agent: None,
            http_timeout_secs: 30,
            network_retries: 3,
            max_challenge_rounds: 3,
            max_solver_attempts: 3,
            solver_timeout_secs: 120,
            run_budget_secs: 240,
            hard_cutoff_secs: 300,
        }
    }
}

/// Keys accepted in the `--config` YAML file. Unset keys leave the current value alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverlay {
    pub portal_url: Option<String>,
    pub detail_url: Option<String>,
    pub solver_submit_url: Option<String>,
    pub solver_result_url: Option<String>,
    pub solver_poll_secs: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub network_retries: Option<usize>,
    pub max_challenge_rounds: Option<u32>,
    pub max_solver_attempts: Option<u32>,
    pub solver_timeout_secs: Option<u64>,
    pub run_budget_secs: Option<u64>,
    pub hard_cutoff_secs: Option<u64>,
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ScrapeConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();
        Self {
            portal_url: text("NEVADA_PORTAL_URL").unwrap_or(defaults.portal_url),
            detail_url: text("NEVADA_DETAIL_URL").unwrap_or(defaults.detail_url),
            solver_api_key: text(API_KEY_VAR),
            solver_submit_url: text("SOLVECAPTCHA_SUBMIT_URL").unwrap_or(defaults.solver_submit_url),
            solver_result_url: text("SOLVECAPTCHA_RESULT_URL").unwrap_or(defaults.solver_result_url),
            solver_poll_secs: text("SOLVECAPTCHA_POLL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.solver_poll_secs),
            output_dir: text("NVSOS_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            user_agent: text("NVSOS_USER_AGENT"),
            http_timeout_secs: text("NVSOS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            network_retries: text("NVSOS_NETWORK_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.network_retries),
            max_challenge_rounds: text("NVSOS_MAX_CHALLENGE_ROUNDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_challenge_rounds),
            max_solver_attempts: text("NVSOS_MAX_SOLVER_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_solver_attempts),
            solver_timeout_secs: text("NVSOS_SOLVER_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.solver_timeout_secs),
            run_budget_secs: text("NVSOS_RUN_BUDGET_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.run_budget_secs),
            hard_cutoff_secs: text("NVSOS_HARD_CUTOFF_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.hard_cutoff_secs),
        }
    }

    pub fn load_overlay(path: &Path) -> Result<ConfigOverlay> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_overlay(mut self, overlay: ConfigOverlay) -> Self {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        set(&mut self.portal_url, overlay.portal_url);
        set(&mut self.detail_url, overlay.detail_url);
        set(&mut self.solver_submit_url, overlay.solver_submit_url);
        set(&mut self.solver_result_url, overlay.solver_result_url);
        set(&mut self.solver_poll_secs, overlay.solver_poll_secs);
        set(&mut self.output_dir, overlay.output_dir);
        if overlay.user_agent.is_some() {
            self.user_agent = overlay.user_agent;
        }
        set(&mut self.http_timeout_secs, overlay.http_timeout_secs);
        set(&mut self.network_retries, overlay.network_retries);
        set(&mut self.max_challenge_rounds, overlay.max_challenge_rounds);
        set(&mut self.max_solver_attempts, overlay.max_solver_attempts);
        set(&mut self.solver_timeout_secs, overlay.solver_timeout_secs);
        set(&mut self.run_budget_secs, overlay.run_budget_secs);
        set(&mut self.hard_cutoff_secs, overlay.hard_cutoff_secs);
        self
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            network: BackoffPolicy {
                max_retries: self.network_retries,
                ..BackoffPolicy::default()
            },
            max_challenge_rounds: self.max_challenge_rounds,
            max_solver_attempts: self.max_solver_attempts,
            solver_timeout: Duration::from_secs(self.solver_timeout_secs),
            run_budget: Duration::from_secs(self.run_budget_secs),
        }
    }

    pub fn portal_config(&self) -> PortalConfig {
        PortalConfig {
            entry_url: self.portal_url.clone(),
            detail_url: self.detail_url.clone(),
            http: HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
                user_agent: self.user_agent.clone(),
            },
        }
    }

    /// `None` when no API key is configured.
    pub fn solver_config(&self) -> Option<SolverConfig> {
        let api_key = self.solver_api_key.clone()?;
        Some(SolverConfig {
            submit_url: self.solver_submit_url.clone(),
            result_url: self.solver_result_url.clone(),
            poll_interval: Duration::from_secs(self.solver_poll_secs.max(1)),
            request_timeout: Duration::from_secs(self.http_timeout_secs),
            ..SolverConfig::new(api_key)
        })
    }

    pub fn hard_cutoff(&self) -> Duration {
        Duration::from_secs(self.hard_cutoff_secs)
    }
}

impl fmt::Debug for ScrapeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeConfig")
            .field("portal_url", &self.portal_url)
            .field("detail_url", &self.detail_url)
            .field(
                "solver_api_key",
                &self.solver_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("solver_submit_url", &self.solver_submit_url)
            .field("solver_result_url", &self.solver_result_url)
            .field("output_dir", &self.output_dir)
            .field("network_retries", &self.network_retries)
            .field("max_challenge_rounds", &self.max_challenge_rounds)
            .field("max_solver_attempts", &self.max_solver_attempts)
            .field("solver_timeout_secs", &self.solver_timeout_secs)
            .field("run_budget_secs", &self.run_budget_secs)
            .field("hard_cutoff_secs", &self.hard_cutoff_secs)
            .finish_non_exhaustive()
    }
}
