//! Final result assembly and hand-off to the persistence collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token;

use super::run::{AutomationRun, FailureKind, RunStatus};
use super::sink::ResultSink;

/// What a caller gets back from one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationResult {
    pub run_id: Uuid,
    pub success: bool,
    pub access_token: Option<String>,
    /// Read from browser storage; the tap never sees it.
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub session_token: Option<String>,
    pub subject_id: Option<String>,
    pub session_token_expires_at: Option<DateTime<Utc>>,
    pub requests_observed: u64,
    /// Stable kebab-case cause, e.g. `silent-auth-failure`.
    pub failure_reason: Option<String>,
    pub failure_detail: Option<String>,
    pub integration_token: Option<String>,
    pub integration_error: Option<String>,
    pub final_status: RunStatus,
    pub location_id: String,
    pub callback_identity: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AutomationResult {
    /// Build the result for a finished run.
    ///
    /// Success requires a completed run holding a session token. The access
    /// token is carried when seen but never required.
    pub fn from_run(run: &AutomationRun) -> Self {
        let session_token = run.session_token().map(str::to_string);
        let completed = run.status() == RunStatus::Completed;
        let success = completed && session_token.is_some();

        let (failure_reason, failure_detail) = match (run.error(), success) {
            (_, true) => (None, None),
            (Some(failure), false) => (
                Some(failure.kind.reason().to_string()),
                Some(failure.detail.clone()),
            ),
            (None, false) if completed => (
                Some(FailureKind::SilentAuthFailure.reason().to_string()),
                Some("run completed without a session token".to_string()),
            ),
            (None, false) => (
                Some(FailureKind::Internal.reason().to_string()),
                Some(format!("run reported while still {}", run.status())),
            ),
        };

        let session_token_expires_at = session_token
            .as_deref()
            .and_then(|t| token::decode_claims(t).ok())
            .and_then(|claims| claims.expires_at);

        Self {
            run_id: run.id,
            success,
            access_token: run.access_token().map(str::to_string),
            refresh_token: run.refresh_token().map(str::to_string),
            session_token,
            subject_id: run.subject_id().map(str::to_string),
            session_token_expires_at,
            requests_observed: run.requests_observed(),
            failure_reason,
            failure_detail,
            integration_token: run.integration_token.clone(),
            integration_error: run.integration_error.clone(),
            final_status: run.status(),
            location_id: run.location_id.clone(),
            callback_identity: run.callback_identity.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

/// Turns a finished run into an [`AutomationResult`] and delivers it.
#[derive(Default)]
pub struct ResultReporter {
    sink: Option<Box<dyn ResultSink>>,
}

impl ResultReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Box<dyn ResultSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Assemble the result and hand it to the sink, if any.
    ///
    /// Delivery failures are logged and never retried; the caller still
    /// receives the result.
    pub async fn report(&self, run: &AutomationRun) -> AutomationResult {
        let result = AutomationResult::from_run(run);

        if result.success {
            tracing::info!(
                run_id = %result.run_id,
                subject_id = result.subject_id.as_deref().unwrap_or("-"),
                requests_observed = result.requests_observed,
                "Credentials captured"
            );
        } else {
            tracing::warn!(
                run_id = %result.run_id,
                reason = result.failure_reason.as_deref().unwrap_or("-"),
                requests_observed = result.requests_observed,
                "Run did not capture credentials"
            );
        }

        if let Some(sink) = &self.sink {
            match sink.deliver(&result).await {
                Ok(()) => tracing::debug!(sink = sink.name(), "Result delivered"),
                Err(e) => tracing::error!(
                    sink = sink.name(),
                    run_id = %result.run_id,
                    error = %format!("{e:#}"),
                    "Failed to deliver result"
                ),
            }
        }

        result
    }
}
