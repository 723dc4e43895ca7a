//! Scrape pipeline: configuration, the orchestrator state machine and run persistence.

mod config;
mod orchestrator;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use nvsos_core::{FailureCode, RunCounters, RunStage, ScrapeRequest, ScrapeResult};
use nvsos_portal::HttpPortalConnector;
use nvsos_solver::SolveCaptchaClient;
use nvsos_storage::ArtifactStore;
use tracing::{info, warn};

pub use config::{ConfigOverlay, ScrapeConfig, API_KEY_VAR};
pub use orchestrator::{RunSettings, ScrapeFailure, ScrapeOrchestrator, ScrapeRun};

pub const CRATE_NAME: &str = "nvsos-scrape";

/// A run after its artifacts reached disk.
#[derive(Debug, Clone)]
pub struct PersistedRun {
    pub result: ScrapeResult,
    pub result_path: PathBuf,
    pub snapshot_path: Option<PathBuf>,
}

/// Build an orchestrator wired to the live portal and solving service.
pub fn orchestrator_from_config(config: &ScrapeConfig) -> Result<ScrapeOrchestrator, ScrapeFailure> {
    let solver_config = config.solver_config().ok_or_else(|| {
        ScrapeFailure::new(
            RunStage::Start,
            FailureCode::Config,
            format!("{API_KEY_VAR} is not set"),
        )
    })?;
    let solver = SolveCaptchaClient::new(solver_config).map_err(|err| {
        ScrapeFailure::new(RunStage::Start, FailureCode::Config, err.to_string())
    })?;
    Ok(ScrapeOrchestrator::new(
        config.run_settings(),
        Box::new(HttpPortalConnector::new(config.portal_config())),
        Box::new(solver),
    ))
}

/// Write the HTML snapshot, then the JSON result exactly once.
///
/// A snapshot failure is logged and does not prevent the JSON from being written.
pub async fn persist_run(
    store: &ArtifactStore,
    request: &ScrapeRequest,
    run: ScrapeRun,
) -> Result<PersistedRun> {
    let ScrapeRun {
        mut result,
        snapshot_html,
    } = run;

    let snapshot_path = match store
        .write_snapshot(request, snapshot_html.as_deref().unwrap_or_default())
        .await
    {
        Ok(artifact) => {
            result.metadata.html_snapshot = Some(artifact.file_name);
            Some(artifact.absolute_path)
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "html snapshot not written");
            None
        }
    };

    let artifact = store
        .write_result(request, &result)
        .await
        .context("writing scrape result")?;
    info!(
        path = %artifact.absolute_path.display(),
        success = result.success(),
        "scrape result written"
    );
    Ok(PersistedRun {
        result,
        result_path: artifact.absolute_path,
        snapshot_path,
    })
}

/// Run one request end to end against the live services and persist its artifacts.
///
/// Unusable input or configuration still produces a written failure result.
pub async fn run_scrape(config: &ScrapeConfig, request: &ScrapeRequest) -> Result<PersistedRun> {
    if request.file_number.is_empty() {
        return persist_config_failure(config, request, "file number must not be empty").await;
    }
    let orchestrator = match orchestrator_from_config(config) {
        Ok(orchestrator) => orchestrator,
        Err(failure) => return persist_config_failure(config, request, failure.message).await,
    };
    let store = ArtifactStore::new(config.output_dir.clone());
    let run = orchestrator.run(request).await;
    persist_run(&store, request, run).await
}

/// Record a run that never reached the portal because its setup was rejected.
pub async fn persist_config_failure(
    config: &ScrapeConfig,
    request: &ScrapeRequest,
    message: impl Into<String>,
) -> Result<PersistedRun> {
    let failure = ScrapeFailure::new(RunStage::Start, FailureCode::Config, message);
    warn!(code = %failure.code, error = %failure.message, "run rejected before start");
    let run = ScrapeRun {
        result: ScrapeResult::failed(
            request,
            Utc::now(),
            RunCounters::default(),
            failure.stage,
            failure.code,
            failure.message,
            None,
        ),
        snapshot_html: None,
    };
    let store = ArtifactStore::new(config.output_dir.clone());
    persist_run(&store, request, run).await
}

#[cfg(test)]
mod tests {
    use super::orchestrator::tests::{page, request, FakeSolver, ScriptedPortal};
    use super::*;

    fn json_files(dir: &std::path::Path) -> Vec<String> {
        let mut names = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".json"))
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[tokio::test]
    async fn successful_run_writes_one_json_and_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let orchestrator = ScrapeOrchestrator::new(
            RunSettings::default(),
            Box::new(ScriptedPortal::new(vec![page("entity_detail.html")])),
            Box::new(FakeSolver::tokens()),
        );
        let request = request();
        let run = orchestrator.run(&request).await;
        let persisted = persist_run(&store, &request, run).await.unwrap();

        assert_eq!(json_files(dir.path()), vec!["scraped_data_req-42_E10281132020-8.json"]);
        let written: ScrapeResult =
            serde_json::from_slice(&std::fs::read(&persisted.result_path).unwrap()).unwrap();
        assert!(written.success());
        assert_eq!(
            written.metadata.html_snapshot.as_deref(),
            Some("page_snapshot_req-42_E10281132020-8.html")
        );
        let snapshot = std::fs::read_to_string(persisted.snapshot_path.unwrap()).unwrap();
        assert!(snapshot.contains("SILVER SAGE HOLDINGS LLC"));
    }

    #[tokio::test]
    async fn failed_run_still_writes_its_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let orchestrator = ScrapeOrchestrator::new(
            RunSettings::default(),
            Box::new(ScriptedPortal::new(vec![page("no_records.html")])),
            Box::new(FakeSolver::tokens()),
        );
        let request = request();
        let run = orchestrator.run(&request).await;
        persist_run(&store, &request, run).await.unwrap();

        let names = json_files(dir.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].contains("req-42") && names[0].contains("E10281132020-8"));
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(&names[0])).unwrap()).unwrap();
        assert_eq!(value["metadata"]["success"], false);
        assert_eq!(value["metadata"]["error_code"], "no_match");
        assert!(value["entity_information"].is_null());
    }

    #[tokio::test]
    async fn missing_api_key_is_a_written_config_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScrapeConfig {
            output_dir: dir.path().to_path_buf(),
            solver_api_key: None,
            ..ScrapeConfig::default()
        };
        let request = ScrapeRequest::new("E1", None);
        let persisted = run_scrape(&config, &request).await.unwrap();

        assert!(!persisted.result.success());
        assert_eq!(persisted.result.metadata.error_code, Some(FailureCode::Config));
        assert_eq!(persisted.result.metadata.stage, RunStage::Start);
        assert!(persisted
            .result
            .metadata
            .error
            .as_deref()
            .unwrap()
            .contains(API_KEY_VAR));
        assert!(persisted.result_path.exists());
        assert_eq!(json_files(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn empty_file_number_is_a_written_config_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScrapeConfig {
            output_dir: dir.path().to_path_buf(),
            solver_api_key: Some("key".to_string()),
            ..ScrapeConfig::default()
        };
        let request = ScrapeRequest::new("   ", Some("blank".to_string()));
        let persisted = run_scrape(&config, &request).await.unwrap();

        assert_eq!(persisted.result.metadata.error_code, Some(FailureCode::Config));
        assert_eq!(persisted.result.metadata.stage, RunStage::Start);
        assert_eq!(persisted.result.metadata.attempts, 0);
        assert_eq!(json_files(dir.path()), vec!["scraped_data_blank_unknown.json"]);
    }

    #[tokio::test]
    async fn concurrent_requests_write_distinct_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut handles = Vec::new();
        for n in 0..3 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let orchestrator = ScrapeOrchestrator::new(
                    RunSettings::default(),
                    Box::new(ScriptedPortal::new(vec![page("entity_detail.html")])),
                    Box::new(FakeSolver::tokens()),
                );
                let request = ScrapeRequest::new("E10281132020-8", Some(format!("job-{n}")));
                let run = orchestrator.run(&request).await;
                persist_run(&store, &request, run).await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().result.success());
        }
        assert_eq!(json_files(dir.path()).len(), 3);
    }
}
