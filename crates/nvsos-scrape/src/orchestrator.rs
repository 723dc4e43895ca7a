use std::time::Duration;

use chrono::{DateTime, Utc};
use nvsos_core::{
    CaptchaChallenge, CaptchaSolution, EntityRecord, FailureCode, RunCounters, RunStage,
    ScrapeRequest, ScrapeResult,
};
use nvsos_portal::{
    parse_entity_page, PageKind, PortalError, PortalPage, PortalSession, SessionFactory,
};
use nvsos_solver::{CaptchaSolver, SolverError};
use nvsos_storage::BackoffPolicy;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Retry and time limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// Backoff for network-level failures while loading and submitting.
    pub network: BackoffPolicy,
    /// Challenge pages answered before giving up.
    pub max_challenge_rounds: u32,
    /// Solver calls per run, across all challenge rounds.
    pub max_solver_attempts: u32,
    pub solver_timeout: Duration,
    /// Soft wall-clock budget. Once spent, remaining retries are abandoned.
    pub run_budget: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            network: BackoffPolicy::default(),
            max_challenge_rounds: 3,
            max_solver_attempts: 3,
            solver_timeout: Duration::from_secs(120),
            run_budget: Duration::from_secs(240),
        }
    }
}

/// Terminal failure of a run, tagged with the stage it happened in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} during {stage}: {message}")]
pub struct ScrapeFailure {
    pub stage: RunStage,
    pub code: FailureCode,
    pub message: String,
}

impl ScrapeFailure {
    pub fn new(stage: RunStage, code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
        }
    }
}

/// Outcome of a run before it is written to disk.
#[derive(Debug, Clone)]
pub struct ScrapeRun {
    pub result: ScrapeResult,
    /// Last page the session fetched, if any.
    pub snapshot_html: Option<String>,
}

#[derive(Clone, Copy)]
enum PortalCall<'a> {
    Open,
    Search(&'a str),
    Answer(&'a CaptchaSolution),
}

impl PortalCall<'_> {
    fn name(&self) -> &'static str {
        match self {
            PortalCall::Open => "open",
            PortalCall::Search(_) => "search",
            PortalCall::Answer(_) => "answer",
        }
    }

    async fn invoke(self, session: &mut dyn PortalSession) -> Result<PortalPage, PortalError> {
        match self {
            PortalCall::Open => session.open().await,
            PortalCall::Search(file_number) => session.submit_file_number(file_number).await,
            PortalCall::Answer(solution) => session.submit_challenge_response(solution).await,
        }
    }
}

struct RunState {
    stage: RunStage,
    counters: RunCounters,
    deadline: Instant,
    partial: Option<EntityRecord>,
}

impl RunState {
    fn new(budget: Duration) -> Self {
        Self {
            stage: RunStage::Start,
            counters: RunCounters::default(),
            deadline: Instant::now()
                .checked_add(budget)
                .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
            partial: None,
        }
    }

    fn enter(&mut self, stage: RunStage) {
        if self.stage != stage {
            info!(from = %self.stage, to = %stage, "stage transition");
        }
        self.stage = stage;
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn fail(&self, code: FailureCode, message: impl Into<String>) -> ScrapeFailure {
        ScrapeFailure::new(self.stage, code, message)
    }

    fn out_of_time(&self) -> ScrapeFailure {
        self.fail(FailureCode::Deadline, "run budget exhausted")
    }
}

/// Drives one scrape from search to parsed record.
pub struct ScrapeOrchestrator {
    settings: RunSettings,
    sessions: Box<dyn SessionFactory>,
    solver: Box<dyn CaptchaSolver>,
}

impl ScrapeOrchestrator {
    pub fn new(
        settings: RunSettings,
        sessions: Box<dyn SessionFactory>,
        solver: Box<dyn CaptchaSolver>,
    ) -> Self {
        Self {
            settings,
            sessions,
            solver,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Run the state machine to completion. Every path ends in a `ScrapeResult`.
    pub async fn run(&self, request: &ScrapeRequest) -> ScrapeRun {
        let span = info_span!(
            "scrape",
            request_id = %request.request_id,
            file_number = %request.file_number
        );
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: &ScrapeRequest) -> ScrapeRun {
        let started_at = Utc::now();
        let mut state = RunState::new(self.settings.run_budget);

        let mut session = match self.sessions.new_session() {
            Ok(session) => session,
            Err(err) => {
                let failure = state.fail(FailureCode::Config, err.to_string());
                return ScrapeRun {
                    result: finish(request, started_at, state, Err(failure)),
                    snapshot_html: None,
                };
            }
        };

        let outcome = self.drive(session.as_mut(), request, &mut state).await;
        let snapshot_html = session.last_page().map(|page| page.html.clone());
        ScrapeRun {
            result: finish(request, started_at, state, outcome),
            snapshot_html,
        }
    }

    async fn drive(
        &self,
        session: &mut dyn PortalSession,
        request: &ScrapeRequest,
        state: &mut RunState,
    ) -> Result<EntityRecord, ScrapeFailure> {
        state.enter(RunStage::Loading);
        self.call(session, state, PortalCall::Open).await?;
        let mut page = self
            .call(session, state, PortalCall::Search(&request.file_number))
            .await?;

        loop {
            match page.kind {
                PageKind::ResultPage => return self.parse(&page, state),
                PageKind::NoMatchFound => {
                    return Err(state.fail(
                        FailureCode::NoMatch,
                        format!("no entity found for file number {}", request.file_number),
                    ))
                }
                PageKind::Unrecognized => {
                    return Err(state.fail(
                        FailureCode::Parse,
                        format!("unrecognized portal page at {}", page.url),
                    ))
                }
                PageKind::ChallengePage => {
                    if state.counters.challenge_rounds >= self.settings.max_challenge_rounds {
                        return Err(state.fail(
                            FailureCode::ChallengeRejected,
                            format!(
                                "challenge still present after {} rounds",
                                state.counters.challenge_rounds
                            ),
                        ));
                    }
                    state.counters.challenge_rounds += 1;
                    state.enter(RunStage::ChallengeDetected);
                    let Some(challenge) = page.challenge.clone() else {
                        return Err(state.fail(
                            FailureCode::Parse,
                            format!("challenge page at {} has no solvable widget", page.url),
                        ));
                    };
                    info!(round = state.counters.challenge_rounds, kind = ?challenge.kind, "challenge round");

                    let solution = self.solve(&challenge, state).await?;
                    state.enter(RunStage::Submitting);
                    page = self
                        .call(session, state, PortalCall::Answer(&solution))
                        .await?;
                }
            }
        }
    }

    /// One portal request with network retries and backoff, bounded by the run budget.
    async fn call(
        &self,
        session: &mut dyn PortalSession,
        state: &mut RunState,
        call: PortalCall<'_>,
    ) -> Result<PortalPage, ScrapeFailure> {
        let policy = self.settings.network;
        let mut retry = 0usize;
        loop {
            let remaining = state.remaining();
            if remaining.is_zero() {
                return Err(state.out_of_time());
            }
            state.counters.attempts += 1;

            let err = match tokio::time::timeout(remaining, call.invoke(session)).await {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(err)) => err,
                Err(_) => return Err(state.out_of_time()),
            };

            if !err.is_retryable() {
                return Err(state.fail(failure_code_for(&err), err.to_string()));
            }
            if retry >= policy.max_retries {
                return Err(state.fail(
                    FailureCode::Connectivity,
                    format!("{} failed after {} attempts: {err}", call.name(), retry + 1),
                ));
            }
            let delay = policy.delay_for_attempt(retry);
            if delay >= state.remaining() {
                return Err(state.out_of_time());
            }
            warn!(call = call.name(), retry = retry + 1, ?delay, error = %err, "retrying portal request");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn solve(
        &self,
        challenge: &CaptchaChallenge,
        state: &mut RunState,
    ) -> Result<CaptchaSolution, ScrapeFailure> {
        state.enter(RunStage::Solving);
        let mut last_error = None;
        while state.counters.solver_attempts < self.settings.max_solver_attempts {
            let remaining = state.remaining();
            if remaining.is_zero() {
                return Err(state.out_of_time());
            }
            state.counters.solver_attempts += 1;
            // When the run budget is shorter than the solver timeout, running out is a deadline.
            let budget_bound = remaining < self.settings.solver_timeout;
            let timeout = self.settings.solver_timeout.min(remaining);

            let outcome = tokio::time::timeout(timeout, self.solver.solve(challenge, timeout))
                .await
                .unwrap_or(Err(SolverError::Timeout { waited: timeout }));
            match outcome {
                Ok(solution) => return Ok(solution),
                Err(SolverError::Timeout { .. }) if budget_bound => {
                    warn!(attempt = state.counters.solver_attempts, ?timeout, "run budget ran out while solving");
                    return Err(state.out_of_time());
                }
                Err(err) => {
                    warn!(attempt = state.counters.solver_attempts, error = %err, "solver attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(match last_error {
            Some(err) => state.fail(solver_failure_code(&err), err.to_string()),
            None => state.fail(
                FailureCode::SolverRejected,
                format!(
                    "solver attempt budget of {} already spent",
                    self.settings.max_solver_attempts
                ),
            ),
        })
    }

    fn parse(&self, page: &PortalPage, state: &mut RunState) -> Result<EntityRecord, ScrapeFailure> {
        state.enter(RunStage::Parsing);
        match parse_entity_page(&page.html) {
            Ok(record) if record.has_entity_name() => Ok(record),
            Ok(record) => {
                state.partial = Some(record);
                Err(state.fail(FailureCode::Parse, "detail page has no entity name"))
            }
            Err(err) => Err(state.fail(FailureCode::Parse, err.to_string())),
        }
    }
}

fn failure_code_for(err: &PortalError) -> FailureCode {
    match err {
        PortalError::Fetch(_) => FailureCode::Connectivity,
        PortalError::Setup(_) => FailureCode::Config,
        PortalError::Protocol(_) => FailureCode::Parse,
    }
}

fn solver_failure_code(err: &SolverError) -> FailureCode {
    match err {
        SolverError::Timeout { .. } => FailureCode::SolverTimeout,
        SolverError::Rejected { .. } | SolverError::Malformed(_) => FailureCode::SolverRejected,
        SolverError::Transport(_) => FailureCode::Connectivity,
    }
}

fn finish(
    request: &ScrapeRequest,
    started_at: DateTime<Utc>,
    mut state: RunState,
    outcome: Result<EntityRecord, ScrapeFailure>,
) -> ScrapeResult {
    match outcome {
        Ok(record) => {
            info!(
                attempts = state.counters.attempts,
                challenge_rounds = state.counters.challenge_rounds,
                officers = record.officers.len(),
                "scrape succeeded"
            );
            ScrapeResult::succeeded(request, started_at, state.counters, record)
        }
        Err(failure) => {
            warn!(stage = %failure.stage, code = %failure.code, error = %failure.message, "scrape failed");
            ScrapeResult::failed(
                request,
                started_at,
                state.counters,
                failure.stage,
                failure.code,
                failure.message,
                state.partial.take(),
            )
        }
    }
}
