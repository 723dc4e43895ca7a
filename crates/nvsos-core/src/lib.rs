//! Core domain model for Nevada entity scrapes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "nvsos-core";

/// Value written into `metadata.source` of every result.
pub const SOURCE_NAME: &str = "Nevada Secretary of State";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One file-number lookup. Built once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub file_number: String,
    pub request_id: String,
}

impl ScrapeRequest {
    /// Builds a request, synthesizing a request id when the caller did not supply one.
    pub fn new(file_number: impl Into<String>, request_id: Option<String>) -> Self {
        let request_id = request_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| synthesize_request_id(Utc::now()));
        Self {
            file_number: file_number.into().trim().to_string(),
            request_id,
        }
    }

    pub fn result_file_name(&self) -> String {
        result_file_name(&self.request_id, &self.file_number)
    }

    pub fn snapshot_file_name(&self) -> String {
        snapshot_file_name(&self.request_id, &self.file_number)
    }
}

/// Combines wall-clock seconds, the process id and a process-wide monotonic counter.
pub fn synthesize_request_id(now: DateTime<Utc>) -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("nevada-{}-{}-{}", now.timestamp(), std::process::id(), seq)
}

pub fn result_file_name(request_id: &str, file_number: &str) -> String {
    format!(
        "scraped_data_{}_{}.json",
        file_name_fragment(request_id),
        file_name_fragment(file_number)
    )
}

pub fn snapshot_file_name(request_id: &str, file_number: &str) -> String {
    format!(
        "page_snapshot_{}_{}.html",
        file_name_fragment(request_id),
        file_name_fragment(file_number)
    )
}

fn file_name_fragment(input: &str) -> String {
    let cleaned = input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenWidget {
    HCaptcha,
    ReCaptcha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChallengeKind {
    /// `payload` holds the base64-encoded image.
    Image,
    /// `payload` holds the widget site key.
    Token { widget: TokenWidget },
}

/// A CAPTCHA presented by the portal, as handed to the solving service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    pub kind: ChallengeKind,
    pub payload: String,
    pub page_url: String,
}

impl CaptchaChallenge {
    pub fn token(widget: TokenWidget, site_key: impl Into<String>, page_url: impl Into<String>) -> Self {
        Self {
            kind: ChallengeKind::Token { widget },
            payload: site_key.into(),
            page_url: page_url.into(),
        }
    }

    pub fn image(base64_image: impl Into<String>, page_url: impl Into<String>) -> Self {
        Self {
            kind: ChallengeKind::Image,
            payload: base64_image.into(),
            page_url: page_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaSolution {
    pub token: String,
    pub solved_at: DateTime<Utc>,
    /// User agent the solving service used; the portal may bind the token to it.
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Officer {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl Officer {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.name.is_none()
            && self.address.is_none()
            && self.last_updated.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegisteredAgent {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub cra_agent_entity_type: Option<String>,
    #[serde(default)]
    pub nv_business_id: Option<String>,
    #[serde(default)]
    pub office_or_position: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub street_address: Option<String>,
    #[serde(default)]
    pub mailing_address: Option<String>,
}

impl RegisteredAgent {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Normalized public filing data. Every field is optional: detail pages vary in completeness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityRecord {
    #[serde(default)]
    pub entity_name: Option<String>,
    #[serde(default)]
    pub entity_number: Option<String>,
    #[serde(default)]
    pub entity_status: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub formation_date: Option<String>,
    #[serde(default)]
    pub nv_business_id: Option<String>,
    #[serde(default)]
    pub termination_date: Option<String>,
    #[serde(default)]
    pub annual_report_due_date: Option<String>,
    #[serde(default)]
    pub compliance_hold: Option<String>,
    #[serde(default)]
    pub registered_agent: Option<RegisteredAgent>,
    /// Portal listing order.
    #[serde(default)]
    pub officers: Vec<Officer>,
}

impl EntityRecord {
    pub fn has_entity_name(&self) -> bool {
        self.entity_name
            .as_deref()
            .map(|name| !name.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Pipeline states. `Done` is terminal; the failing stage is recorded separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Start,
    Loading,
    ChallengeDetected,
    Solving,
    Submitting,
    Parsing,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStage::Start => "start",
            RunStage::Loading => "loading",
            RunStage::ChallengeDetected => "challenge_detected",
            RunStage::Solving => "solving",
            RunStage::Submitting => "submitting",
            RunStage::Parsing => "parsing",
            RunStage::Done => "done",
        };
        f.write_str(label)
    }
}

/// Stable failure classification written to `metadata.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    Connectivity,
    SolverTimeout,
    SolverRejected,
    ChallengeRejected,
    NoMatch,
    Parse,
    Deadline,
    Config,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureCode::Connectivity => "connectivity",
            FailureCode::SolverTimeout => "solver_timeout",
            FailureCode::SolverRejected => "solver_rejected",
            FailureCode::ChallengeRejected => "challenge_rejected",
            FailureCode::NoMatch => "no_match",
            FailureCode::Parse => "parse",
            FailureCode::Deadline => "deadline",
            FailureCode::Config => "config",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeMetadata {
    pub source: String,
    pub request_id: String,
    pub file_number: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Portal requests issued, retries included.
    pub attempts: u32,
    #[serde(default)]
    pub challenge_rounds: u32,
    #[serde(default)]
    pub solver_attempts: u32,
    /// Last stage entered before reaching `Done`.
    pub stage: RunStage,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<FailureCode>,
    #[serde(default)]
    pub html_snapshot: Option<String>,
}

/// Counters collected while a run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunCounters {
    pub attempts: u32,
    pub challenge_rounds: u32,
    pub solver_attempts: u32,
}

/// The persisted artifact of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub metadata: ScrapeMetadata,
    pub entity_information: Option<EntityRecord>,
}

impl ScrapeResult {
    pub fn succeeded(
        request: &ScrapeRequest,
        started_at: DateTime<Utc>,
        counters: RunCounters,
        record: EntityRecord,
    ) -> Self {
        Self {
            metadata: ScrapeMetadata {
                source: SOURCE_NAME.to_string(),
                request_id: request.request_id.clone(),
                file_number: request.file_number.clone(),
                success: true,
                started_at,
                completed_at: Utc::now(),
                attempts: counters.attempts,
                challenge_rounds: counters.challenge_rounds,
                solver_attempts: counters.solver_attempts,
                stage: RunStage::Parsing,
                error: None,
                error_code: None,
                html_snapshot: None,
            },
            entity_information: Some(record),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn failed(
        request: &ScrapeRequest,
        started_at: DateTime<Utc>,
        counters: RunCounters,
        stage: RunStage,
        code: FailureCode,
        error: impl Into<String>,
        partial: Option<EntityRecord>,
    ) -> Self {
        Self {
            metadata: ScrapeMetadata {
                source: SOURCE_NAME.to_string(),
                request_id: request.request_id.clone(),
                file_number: request.file_number.clone(),
                success: false,
                started_at,
                completed_at: Utc::now(),
                attempts: counters.attempts,
                challenge_rounds: counters.challenge_rounds,
                solver_attempts: counters.solver_attempts,
                stage,
                error: Some(error.into()),
                error_code: Some(code),
                html_snapshot: None,
            },
            entity_information: partial,
        }
    }

    pub fn success(&self) -> bool {
        self.metadata.success
    }

    /// `success` implies a named entity; failure implies an error message.
    pub fn is_consistent(&self) -> bool {
        if self.metadata.success {
            self.entity_information
                .as_ref()
                .map(EntityRecord::has_entity_name)
                .unwrap_or(false)
                && self.metadata.error.is_none()
        } else {
            self.metadata.error.is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn officer(title: &str, name: &str) -> Officer {
        Officer {
            title: Some(title.to_string()),
            name: Some(name.to_string()),
            address: Some("1 MAIN ST, LAS VEGAS, NV, 89101, USA".to_string()),
            last_updated: None,
            status: Some("Active".to_string()),
        }
    }

    fn sample_record() -> EntityRecord {
        EntityRecord {
            entity_name: Some("SILVER STATE HOLDINGS LLC".to_string()),
            entity_number: Some("E10281132020-8".to_string()),
            entity_status: Some("Active".to_string()),
            entity_type: Some("Domestic Limited-Liability Company".to_string()),
            formation_date: Some("03/02/2020".to_string()),
            nv_business_id: Some("NV20201234567".to_string()),
            termination_date: None,
            annual_report_due_date: Some("3/31/2025".to_string()),
            compliance_hold: None,
            registered_agent: Some(RegisteredAgent {
                name: Some("REGISTERED AGENTS INC.".to_string()),
                status: Some("Active".to_string()),
                ..RegisteredAgent::default()
            }),
            officers: vec![
                officer("Manager", "ZED ALPHA"),
                officer("Managing Member", "ANNA BETA"),
                officer("Secretary", "MO GAMMA"),
            ],
        }
    }

    #[test]
    fn entity_record_survives_json_round_trip() {
        let record = sample_record();
        let json = serde_json::to_string(&record).unwrap();
        let back: EntityRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        let names = back
            .officers
            .iter()
            .map(|o| o.name.as_deref().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["ZED ALPHA", "ANNA BETA", "MO GAMMA"]);
    }

    #[test]
    fn sparse_record_deserializes_with_defaults() {
        let back: EntityRecord = serde_json::from_str(r#"{"entity_name":"ACME"}"#).unwrap();
        assert_eq!(back.entity_name.as_deref(), Some("ACME"));
        assert!(back.officers.is_empty());
        assert!(back.registered_agent.is_none());
    }

    #[test]
    fn explicit_request_id_is_kept_and_missing_one_is_synthesized() {
        let given = ScrapeRequest::new(" E10281132020-8 ", Some("run-42".to_string()));
        assert_eq!(given.request_id, "run-42");
        assert_eq!(given.file_number, "E10281132020-8");

        let a = ScrapeRequest::new("E1", None);
        let b = ScrapeRequest::new("E1", Some("   ".to_string()));
        assert!(a.request_id.starts_with("nevada-"));
        assert!(b.request_id.starts_with("nevada-"));
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn synthesized_ids_are_unique_for_the_same_instant() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).single().unwrap();
        let first = synthesize_request_id(now);
        let second = synthesize_request_id(now);
        assert_ne!(first, second);
    }

    #[test]
    fn artifact_names_embed_request_id_and_file_number() {
        let request = ScrapeRequest::new("E10281132020-8", Some("gh-991".to_string()));
        assert_eq!(
            request.result_file_name(),
            "scraped_data_gh-991_E10281132020-8.json"
        );
        assert_eq!(
            request.snapshot_file_name(),
            "page_snapshot_gh-991_E10281132020-8.html"
        );
        assert_eq!(
            result_file_name("a/b", "../x"),
            "scraped_data_a_b__x.json"
        );
    }

    #[test]
    fn result_invariants_hold_for_both_outcomes() {
        let request = ScrapeRequest::new("E1", Some("r".to_string()));
        let now = Utc::now();
        let ok = ScrapeResult::succeeded(&request, now, RunCounters::default(), sample_record());
        assert!(ok.success());
        assert!(ok.is_consistent());

        let failed = ScrapeResult::failed(
            &request,
            now,
            RunCounters::default(),
            RunStage::Loading,
            FailureCode::NoMatch,
            "no records found",
            None,
        );
        assert!(!failed.success());
        assert!(failed.is_consistent());
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["metadata"]["error_code"], "no_match");
        assert_eq!(json["metadata"]["stage"], "loading");
        assert!(json["entity_information"].is_null());

        let nameless = ScrapeResult::succeeded(
            &request,
            now,
            RunCounters::default(),
            EntityRecord::default(),
        );
        assert!(!nameless.is_consistent());
    }

    #[test]
    fn challenge_kind_serializes_with_type_tag() {
        let challenge = CaptchaChallenge::token(TokenWidget::HCaptcha, "site-key", "https://x");
        let json = serde_json::to_value(&challenge).unwrap();
        assert_eq!(json["kind"]["type"], "token");
        assert_eq!(json["kind"]["widget"], "h_captcha");
    }
}
