//! The session state machine that walks the portal period by period.
//!
//! ```text
//! Unauthenticated -> Authenticating -> [AwaitingManualChallenge] -> Ready
//! Ready -> QueryingPeriod -> AwaitingDownload -> Navigating -> Ready | Completed
//! any state -> Aborted on an authentication or navigation failure
//! ```
//!
//! A [`Portal`] performs the individual browser steps; the [`Navigator`]
//! owns the order they happen in, the timeouts around them, and the
//! decision whether a failure costs one period or the whole session.

use crate::artifacts::{ArtifactCollector, ArtifactHandle};
use crate::error::{FailureClass, HarvestError, Result};
use crate::events::RunObserver;
use crate::extractor::Extractor;
use crate::schema::{Credentials, Period, PeriodRecord, RunConfig, Timeouts};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    AwaitingManualChallenge,
    Ready,
    QueryingPeriod,
    AwaitingDownload,
    Navigating,
    Aborted,
    Completed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Aborted | SessionState::Completed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated,
    /// The portal wants a human to solve a verification step first.
    ChallengeRequired,
}

/// Individual steps against the external portal.
///
/// Implementations do not apply their own overall timeouts; the navigator
/// bounds every call.
#[async_trait]
pub trait Portal: Send {
    /// Opens the login page and submits the credentials.
    async fn submit_credentials(&mut self, credentials: &Credentials) -> Result<LoginOutcome>;

    /// Returns once the manual verification step has been passed.
    async fn await_challenge(&mut self) -> Result<()>;

    /// From the signed-in landing page to the period query form.
    async fn open_query_form(&mut self) -> Result<()>;

    /// Fills in beneficiary and period and submits the query.
    async fn submit_query(&mut self, beneficiary: &str, period: Period) -> Result<()>;

    /// HTML of the queried period once its table has rendered.
    async fn rendered_page(&mut self) -> Result<String>;

    /// Triggers the download of the period's document.
    async fn request_artifact(&mut self) -> Result<()>;

    /// Back from a period's result to an empty query form.
    async fn return_to_query_form(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A recoverable problem with one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodFailure {
    pub period: Period,
    pub class: FailureClass,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct PeriodOutcome {
    pub record: Option<PeriodRecord>,
    pub artifact: Option<ArtifactHandle>,
    pub failures: Vec<PeriodFailure>,
}

pub struct Navigator<P: Portal> {
    portal: P,
    state: SessionState,
    timeouts: Timeouts,
    beneficiary: String,
    extractor: Extractor,
    collector: ArtifactCollector,
    observer: Option<Arc<dyn RunObserver>>,
}

impl<P: Portal> Navigator<P> {
    pub fn new(portal: P, config: &RunConfig, collector: ArtifactCollector) -> Result<Self> {
        Ok(Self {
            portal,
            state: SessionState::Unauthenticated,
            timeouts: config.timeouts.clone(),
            beneficiary: config.credentials.beneficiary.clone(),
            extractor: Extractor::new(&config.portal)?,
            collector,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn collector(&self) -> &ArtifactCollector {
        &self.collector
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
        if let Some(observer) = &self.observer {
            observer.on_state(next);
        }
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(HarvestError::InvalidState {
                expected: expected.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn abort(&mut self, err: HarvestError) -> HarvestError {
        error!("Session aborted: {}", err);
        self.transition(SessionState::Aborted);
        err
    }

    /// Signs in and opens the query form. Ends in `Ready` or `Aborted`.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        self.expect_state(SessionState::Unauthenticated)?;
        self.transition(SessionState::Authenticating);
        info!("Signing in as {}", credentials.username);

        let outcome = match bounded(self.timeouts.navigation(), self.portal.submit_credentials(credentials)).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.abort(HarvestError::Authentication(e.to_string()))),
        };

        if outcome == LoginOutcome::ChallengeRequired {
            self.transition(SessionState::AwaitingManualChallenge);
            info!(
                "Waiting up to {:?} for the login challenge to be solved",
                self.timeouts.challenge()
            );
            if let Err(e) = bounded(self.timeouts.challenge(), self.portal.await_challenge()).await {
                return Err(self.abort(HarvestError::Authentication(format!(
                    "login challenge not completed: {}",
                    e
                ))));
            }
        }

        if let Err(e) = bounded(self.timeouts.navigation(), self.portal.open_query_form()).await {
            return Err(self.abort(HarvestError::Navigation(format!(
                "query form not reachable after login: {}",
                e
            ))));
        }

        self.transition(SessionState::Ready);
        info!("Session ready");
        Ok(())
    }

    /// Runs one period through query, extraction, download and return.
    ///
    /// Extraction and download problems are reported in the outcome and the
    /// session stays usable. A failed query or a failed return to the query
    /// form aborts the session and comes back as `Err`.
    pub async fn advance(&mut self, period: Period) -> Result<PeriodOutcome> {
        self.expect_state(SessionState::Ready)?;
        self.transition(SessionState::QueryingPeriod);
        let mut outcome = PeriodOutcome::default();

        let beneficiary = self.beneficiary.clone();
        if let Err(e) = bounded(self.timeouts.navigation(), self.portal.submit_query(&beneficiary, period)).await {
            return Err(self.abort(HarvestError::Navigation(format!(
                "query for period {} failed: {}",
                period, e
            ))));
        }

        match bounded(self.timeouts.render(), self.portal.rendered_page()).await {
            Ok(html) => {
                let extraction = self.extractor.extract_detailed(&html, period);
                let reason = extraction.failure_reason();
                match (extraction.record, reason) {
                    (Some(record), _) => {
                        info!(
                            "Period {}: {} credits, {} debits",
                            period,
                            record.credits().len(),
                            record.debits().len()
                        );
                        outcome.record = Some(record);
                    }
                    (None, reason) => outcome.failures.push(PeriodFailure {
                        period,
                        class: FailureClass::ExtractionFailure,
                        detail: reason.unwrap_or_default(),
                    }),
                }
            }
            Err(e) => outcome.failures.push(PeriodFailure {
                period,
                class: FailureClass::ExtractionFailure,
                detail: format!("page did not render: {}", e),
            }),
        }

        self.transition(SessionState::AwaitingDownload);
        match self.capture_artifact(period).await {
            Ok(handle) => outcome.artifact = Some(handle),
            Err(e) => outcome.failures.push(PeriodFailure {
                period,
                class: FailureClass::ArtifactTimeout,
                detail: e.to_string(),
            }),
        }

        self.transition(SessionState::Navigating);
        if let Err(e) = bounded(self.timeouts.navigation(), self.portal.return_to_query_form()).await {
            return Err(self.abort(HarvestError::Navigation(format!(
                "could not return to the query form after period {}: {}",
                period, e
            ))));
        }

        for failure in &outcome.failures {
            warn!("Period {} skipped ({}): {}", period, failure.class, failure.detail);
        }

        self.transition(SessionState::Ready);
        Ok(outcome)
    }

    async fn capture_artifact(&mut self, period: Period) -> Result<ArtifactHandle> {
        self.collector.mark_existing()?;
        bounded(self.timeouts.navigation(), self.portal.request_artifact())
            .await
            .map_err(|e| HarvestError::ArtifactTimeout {
                period,
                reason: format!("download not triggered: {}", e),
            })?;
        self.collector.capture(period).await
    }

    /// Ends a session that is not already aborted.
    pub fn finish(&mut self) {
        if !self.state.is_terminal() {
            self.transition(SessionState::Completed);
        }
    }

    /// Closes the portal. Problems are logged only.
    pub async fn close(&mut self) {
        if let Err(e) = bounded(self.timeouts.navigation(), self.portal.close()).await {
            warn!("Portal did not close cleanly: {}", e);
        }
    }

    pub fn into_parts(self) -> (P, ArtifactCollector) {
        (self.portal, self.collector)
    }
}

/// Runs a portal step under a deadline; an expired deadline becomes an error.
async fn bounded<T>(limit: Duration, step: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, step).await {
        Ok(result) => result,
        Err(_) => Err(HarvestError::Portal(format!("timed out after {:?}", limit))),
    }
}
