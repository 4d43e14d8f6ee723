//! One execution of the login-and-capture flow.

use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StorageTokens;
use crate::tap::CaptureSnapshot;

/// Immutable input identifying the account to log in as.
#[derive(Debug)]
pub struct Target {
    /// Deep link into the authenticated app; unauthenticated sessions are
    /// redirected from here to the login page.
    pub login_url: String,
    pub email: String,
    pub password: SecretString,
    pub location_id: String,
    /// Opaque caller identity forwarded to the result sink.
    pub callback_identity: Option<String>,
}

impl Target {
    pub fn new(
        login_url: impl Into<String>,
        email: impl Into<String>,
        password: SecretString,
        location_id: impl Into<String>,
    ) -> Self {
        Self {
            login_url: login_url.into(),
            email: email.into(),
            password,
            location_id: location_id.into(),
            callback_identity: None,
        }
    }

    pub fn with_callback_identity(mut self, identity: impl Into<String>) -> Self {
        self.callback_identity = Some(identity.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Navigating,
    LoginSubmitted,
    AwaitingOtp,
    VerifyingOtp,
    CapturingTokens,
    CreatingSecondaryToken,
    Completed,
    Failed,
}

impl RunStatus {
    fn rank(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Navigating => 1,
            RunStatus::LoginSubmitted => 2,
            RunStatus::AwaitingOtp => 3,
            RunStatus::VerifyingOtp => 4,
            RunStatus::CapturingTokens => 5,
            RunStatus::CreatingSecondaryToken => 6,
            RunStatus::Completed => 7,
            RunStatus::Failed => 8,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Progress is forward-only, with three exceptions: the OTP loop may
    /// bounce between awaiting and verifying, a completed run may enter the
    /// optional secondary-token step and return, and any non-failed run may fail.
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (VerifyingOtp, AwaitingOtp) => true,
            (Completed, CreatingSecondaryToken) => true,
            (Completed, _) => false,
            (CreatingSecondaryToken, Completed) => true,
            (from, to) => to.rank() > from.rank() && to != CreatingSecondaryToken,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Navigating => "navigating",
            RunStatus::LoginSubmitted => "login_submitted",
            RunStatus::AwaitingOtp => "awaiting_otp",
            RunStatus::VerifyingOtp => "verifying_otp",
            RunStatus::CapturingTokens => "capturing_tokens",
            RunStatus::CreatingSecondaryToken => "creating_secondary_token",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("illegal run transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Category of a fatal run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    BrowserSetup,
    NavigationTimeout,
    Navigation,
    LoginForm,
    StaleOtp,
    OtpEntry,
    SilentAuthFailure,
    NoRequestsObserved,
    RunTimeout,
    Internal,
}

impl FailureKind {
    /// Stable reason string handed to callers.
    pub fn reason(self) -> &'static str {
        match self {
            FailureKind::BrowserSetup => "browser-setup-error",
            FailureKind::NavigationTimeout => "navigation-timeout",
            FailureKind::Navigation => "navigation-error",
            FailureKind::LoginForm => "login-form-error",
            FailureKind::StaleOtp => "stale-otp",
            FailureKind::OtpEntry => "otp-entry-error",
            FailureKind::SilentAuthFailure => "silent-auth-failure",
            FailureKind::NoRequestsObserved => "no-requests-observed",
            FailureKind::RunTimeout => "run-timeout",
            FailureKind::Internal => "internal-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {detail}", kind.reason())]
pub struct RunFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl RunFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<TransitionError> for RunFailure {
    fn from(e: TransitionError) -> Self {
        RunFailure::new(FailureKind::Internal, e.to_string())
    }
}

/// Mutable state of one run. Owned by exactly one orchestrator call.
#[derive(Debug)]
pub struct AutomationRun {
    pub id: Uuid,
    pub location_id: String,
    pub callback_identity: Option<String>,
    status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    captured_access_token: Option<String>,
    captured_session_token: Option<String>,
    captured_refresh_token: Option<String>,
    derived_subject_id: Option<String>,
    requests_observed: u64,
    error: Option<RunFailure>,
    /// Outcome of the optional secondary-token step.
    pub integration_token: Option<String>,
    pub integration_error: Option<String>,
    history: Vec<RunStatus>,
}

impl AutomationRun {
    pub fn new(target: &Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            location_id: target.location_id.clone(),
            callback_identity: target.callback_identity.clone(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            captured_access_token: None,
            captured_session_token: None,
            captured_refresh_token: None,
            derived_subject_id: None,
            requests_observed: 0,
            error: None,
            integration_token: None,
            integration_error: None,
            history: vec![RunStatus::Pending],
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Every status this run has been in, in order.
    pub fn history(&self) -> &[RunStatus] {
        &self.history
    }

    pub fn advance(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(run_id = %self.id, from = %self.status, to = %next, "Run transition");
        self.status = next;
        self.history.push(next);
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to `Failed`, keeping the first failure recorded.
    pub fn fail(&mut self, failure: RunFailure) {
        if self.status == RunStatus::Failed {
            return;
        }
        tracing::warn!(
            run_id = %self.id,
            status = %self.status,
            reason = failure.kind.reason(),
            detail = %failure.detail,
            "Run failed"
        );
        self.error = Some(failure);
        self.status = RunStatus::Failed;
        self.history.push(RunStatus::Failed);
        self.finished_at = Some(Utc::now());
    }

    pub fn error(&self) -> Option<&RunFailure> {
        self.error.as_ref()
    }

    /// Fold in what the network tap has seen. Captured values are set once
    /// and never replaced; the request counter only grows.
    pub fn absorb(&mut self, capture: &CaptureSnapshot) {
        if self.captured_access_token.is_none() {
            self.captured_access_token = capture.access_token.clone();
        }
        if self.captured_session_token.is_none() {
            self.captured_session_token = capture.session_token.clone();
        }
        if self.derived_subject_id.is_none() {
            self.derived_subject_id = capture.subject_id.clone();
        }
        self.requests_observed = self.requests_observed.max(capture.requests_observed);
    }

    /// Fold in tokens read from browser storage. The access token only fills
    /// a gap left by the tap.
    pub fn absorb_storage(&mut self, tokens: &StorageTokens) {
        if self.captured_access_token.is_none() {
            self.captured_access_token = tokens.access_token.clone();
        }
        if self.captured_refresh_token.is_none() {
            self.captured_refresh_token = tokens.refresh_token.clone();
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.captured_access_token.as_deref()
    }

    pub fn session_token(&self) -> Option<&str> {
        self.captured_session_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.captured_refresh_token.as_deref()
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.derived_subject_id.as_deref()
    }

    pub fn requests_observed(&self) -> u64 {
        self.requests_observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::new(
            "https://app.example.com/v2/location/loc-1/settings",
            "ops@example.com",
            SecretString::from("hunter2".to_string()),
            "loc-1",
        )
    }

    #[test]
    fn forward_progress_only() {
        use RunStatus::*;
        assert!(Pending.can_advance_to(Navigating));
        assert!(Navigating.can_advance_to(CapturingTokens));
        assert!(!CapturingTokens.can_advance_to(Navigating));
        assert!(!LoginSubmitted.can_advance_to(Pending));
        assert!(!CapturingTokens.can_advance_to(CreatingSecondaryToken));
    }

    #[test]
    fn otp_retry_and_secondary_token_exceptions() {
        use RunStatus::*;
        assert!(AwaitingOtp.can_advance_to(VerifyingOtp));
        assert!(VerifyingOtp.can_advance_to(AwaitingOtp));
        assert!(Completed.can_advance_to(CreatingSecondaryToken));
        assert!(CreatingSecondaryToken.can_advance_to(Completed));
        assert!(!Completed.can_advance_to(CapturingTokens));
        assert!(!Failed.can_advance_to(Completed));
        assert!(!Failed.can_advance_to(Failed));
    }

    #[test]
    fn advance_rejects_backward_transition() {
        let mut run = AutomationRun::new(&target());
        run.advance(RunStatus::Navigating).unwrap();
        run.advance(RunStatus::CapturingTokens).unwrap();
        assert_eq!(
            run.advance(RunStatus::LoginSubmitted),
            Err(TransitionError {
                from: RunStatus::CapturingTokens,
                to: RunStatus::LoginSubmitted,
            })
        );
        assert_eq!(run.status(), RunStatus::CapturingTokens);
    }

    #[test]
    fn fail_keeps_first_cause() {
        let mut run = AutomationRun::new(&target());
        run.fail(RunFailure::new(FailureKind::NavigationTimeout, "first"));
        run.fail(RunFailure::new(FailureKind::Internal, "second"));
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.error().map(|e| e.kind), Some(FailureKind::NavigationTimeout));
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn absorb_is_first_writer_wins() {
        let mut run = AutomationRun::new(&target());
        run.absorb(&CaptureSnapshot {
            access_token: None,
            session_token: Some("session-one".to_string()),
            subject_id: Some("abc".to_string()),
            requests_observed: 4,
        });
        run.absorb(&CaptureSnapshot {
            access_token: Some("access".to_string()),
            session_token: Some("session-two".to_string()),
            subject_id: Some("other".to_string()),
            requests_observed: 2,
        });

        assert_eq!(run.session_token(), Some("session-one"));
        assert_eq!(run.subject_id(), Some("abc"));
        assert_eq!(run.access_token(), Some("access"));
        assert_eq!(run.requests_observed(), 4);
    }

    #[test]
    fn storage_tokens_never_override_the_tap() {
        let mut run = AutomationRun::new(&target());
        run.absorb(&CaptureSnapshot {
            access_token: Some("from-header".to_string()),
            ..CaptureSnapshot::default()
        });
        run.absorb_storage(&StorageTokens {
            access_token: Some("from-storage".to_string()),
            refresh_token: Some("refresh-one".to_string()),
        });
        run.absorb_storage(&StorageTokens {
            access_token: None,
            refresh_token: Some("refresh-two".to_string()),
        });

        assert_eq!(run.access_token(), Some("from-header"));
        assert_eq!(run.refresh_token(), Some("refresh-one"));

        let mut bare = AutomationRun::new(&target());
        bare.absorb_storage(&StorageTokens {
            access_token: Some("from-storage".to_string()),
            refresh_token: None,
        });
        assert_eq!(bare.access_token(), Some("from-storage"));
    }

    #[test]
    fn failure_display_uses_reason() {
        let failure = RunFailure::new(FailureKind::SilentAuthFailure, "no token-id header");
        assert_eq!(failure.to_string(), "silent-auth-failure: no token-id header");
    }
}
