//! The login state machine.
//!
//! Every step is awaited in sequence against one [`AutomationRun`]; the only
//! concurrent actor is the [`NetworkTap`], which the browser feeds in the
//! background and which the orchestrator reads through snapshots.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::Config;
use crate::duration::format_duration;
use crate::mail::{MailPoller, Mailbox, OtpPoll, RetryPolicy};
use crate::storage;
use crate::tap::{preview, NetworkTap};

use super::page::{IntegrationRequest, LoginPage, PageError};
use super::run::{AutomationRun, FailureKind, RunFailure, RunStatus, Target};

/// How often the request counter is sampled while waiting for quiescence.
const QUIESCENCE_POLL: Duration = Duration::from_millis(100);

/// Allowance for one mailbox round trip when deriving the run budget.
const MAIL_ROUND_TRIP: Duration = Duration::from_secs(5);

/// Page actions per run that are bounded by the navigation timeout.
const NAVIGATION_STEPS: u32 = 5;

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub navigation_timeout: Duration,
    pub challenge_window: Duration,
    pub quiescence_idle: Duration,
    pub quiescence_max: Duration,
    pub retry: RetryPolicy,
    /// Explicit wall-clock budget; derived from the other timings when unset.
    pub budget: Option<Duration>,
    /// Secondary-token flow to attempt after a successful capture.
    pub integration: Option<IntegrationRequest>,
    /// Directory for a screenshot of a failed run.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        let integration = config.integration.enabled.then(|| IntegrationRequest {
            name: config.integration.name.clone(),
            scopes: config.integration.scopes.clone(),
        });
        Self {
            navigation_timeout: config.browser.navigation_timeout,
            challenge_window: config.run.challenge_window,
            quiescence_idle: config.run.quiescence_idle,
            quiescence_max: config.run.quiescence_max,
            retry: RetryPolicy::new(config.mail.max_attempts, config.mail.retry_delay),
            budget: config.run.budget,
            integration,
            screenshot_dir: config.run.screenshot_dir.clone(),
        }
    }

    /// Overall wall-clock limit for the primary flow.
    ///
    /// Without an explicit value this is the OTP schedule (the delays between
    /// attempts plus a mailbox round trip each) plus the fixed page timeouts.
    pub fn budget(&self) -> Duration {
        if let Some(budget) = self.budget {
            return budget;
        }
        let otp = self.retry.total_delay() + MAIL_ROUND_TRIP * self.retry.max_attempts;
        otp + self.navigation_timeout * NAVIGATION_STEPS
            + self.challenge_window
            + self.quiescence_max
    }
}

/// Drives one run from `Pending` to a terminal status.
pub struct LoginOrchestrator<'a, P: ?Sized, M> {
    page: &'a P,
    poller: &'a MailPoller<M>,
    tap: Arc<NetworkTap>,
    settings: RunSettings,
}

impl<'a, P, M> LoginOrchestrator<'a, P, M>
where
    P: LoginPage + ?Sized,
    M: Mailbox,
{
    pub fn new(
        page: &'a P,
        poller: &'a MailPoller<M>,
        tap: Arc<NetworkTap>,
        settings: RunSettings,
    ) -> Self {
        Self {
            page,
            poller,
            tap,
            settings,
        }
    }

    /// Execute the flow. Never returns an error: every failure is recorded
    /// on the returned run.
    pub async fn run(&self, target: &Target) -> AutomationRun {
        let mut run = AutomationRun::new(target);
        let span = tracing::info_span!("automation_run", run_id = %run.id, location = %target.location_id);

        async {
            let budget = self.settings.budget();
            tracing::info!(budget = %format_duration(budget), "Starting automation run");

            let outcome = tokio::time::timeout(budget, self.drive(&mut run, target)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => run.fail(failure),
                Err(_) => run.fail(RunFailure::new(
                    FailureKind::RunTimeout,
                    format!(
                        "run exceeded its {} budget while {}",
                        format_duration(budget),
                        run.status()
                    ),
                )),
            }
            run.absorb(&self.tap.snapshot());

            if let (RunStatus::Failed, Some(dir)) =
                (run.status(), &self.settings.screenshot_dir)
            {
                self.save_screenshot(&run, dir).await;
            }

            if run.status() == RunStatus::Completed {
                if let Some(request) = &self.settings.integration {
                    self.create_integration(&mut run, request).await;
                }
            }

            tracing::info!(
                status = %run.status(),
                requests_observed = run.requests_observed(),
                has_session_token = run.session_token().is_some(),
                has_access_token = run.access_token().is_some(),
                "Automation run finished"
            );
        }
        .instrument(span)
        .await;

        run
    }

    async fn drive(&self, run: &mut AutomationRun, target: &Target) -> Result<(), RunFailure> {
        run.advance(RunStatus::Navigating)?;
        self.navigate(&target.login_url).await?;

        let on_login_page = self
            .bounded("detect login page", self.page.is_login_page())
            .await
            .map_err(|e| page_failure(FailureKind::Navigation, e))?;

        if on_login_page {
            self.log_in(run, target).await?;
            run.advance(RunStatus::CapturingTokens)?;
            self.navigate(&target.login_url).await?;
        } else {
            tracing::info!("Session already authenticated, skipping login");
            run.advance(RunStatus::CapturingTokens)?;
        }

        self.capture(run, &target.login_url).await?;
        run.advance(RunStatus::Completed)?;
        Ok(())
    }

    async fn log_in(&self, run: &mut AutomationRun, target: &Target) -> Result<(), RunFailure> {
        let current = self.page.current_url().await.unwrap_or_default();
        tracing::info!(url = %current, "Login page reached, submitting credentials");

        self.bounded(
            "fill credentials",
            self.page
                .fill_credentials(&target.email, target.password.expose_secret()),
        )
        .await
        .map_err(|e| page_failure(FailureKind::LoginForm, e))?;
        self.bounded("submit login", self.page.submit_login())
            .await
            .map_err(|e| page_failure(FailureKind::LoginForm, e))?;
        run.advance(RunStatus::LoginSubmitted)?;

        let window = self.settings.challenge_window;
        let challenged = bounded(
            "detect verification challenge",
            window + self.settings.navigation_timeout,
            self.page.has_secondary_challenge(window),
        )
        .await
        .map_err(|e| page_failure(FailureKind::LoginForm, e))?;

        if challenged {
            self.verify_otp(run).await?;
        } else {
            tracing::info!(window = %format_duration(window), "No verification challenge shown");
        }
        Ok(())
    }

    /// Request a code, then poll until one fresh code has been entered.
    async fn verify_otp(&self, run: &mut AutomationRun) -> Result<(), RunFailure> {
        run.advance(RunStatus::AwaitingOtp)?;

        match self.bounded("request code", self.page.request_code()).await {
            Ok(true) => tracing::info!("Verification code requested"),
            Ok(false) => tracing::info!("No send-code control found, polling anyway"),
            Err(e) => return Err(page_failure(FailureKind::OtpEntry, e)),
        }

        let retry = self.settings.retry;
        let mut last_seen = String::from("mailbox never polled");
        tracing::info!(
            attempts = retry.max_attempts,
            delay = %format_duration(retry.delay),
            freshness = %format_duration(self.poller.freshness()),
            "Polling mailbox for verification code"
        );

        for attempt in retry.attempts() {
            let poll = match self.poller.poll().await {
                Ok(poll) => poll,
                Err(e) => {
                    tracing::warn!(attempt = attempt.number, error = %e, "Mailbox poll failed");
                    OtpPoll::Absent {
                        reason: format!("mailbox error: {e}"),
                    }
                }
            };
            run.advance(RunStatus::VerifyingOtp)?;

            if let OtpPoll::Fresh(otp) = poll {
                tracing::info!(
                    attempt = attempt.number,
                    uid = otp.uid,
                    age_secs = otp.age().as_secs(),
                    "Submitting verification code"
                );
                self.bounded("enter verification code", self.page.submit_digits(&otp.code))
                    .await
                    .map_err(|e| page_failure(FailureKind::OtpEntry, e))?;
                self.poller.consume(&otp).await;
                return Ok(());
            }

            last_seen = poll.describe();
            tracing::info!(
                attempt = attempt.number,
                of = attempt.of,
                result = %last_seen,
                "No usable verification code yet"
            );
            run.advance(RunStatus::AwaitingOtp)?;
            if !attempt.is_last() {
                tokio::time::sleep(retry.delay).await;
            }
        }

        Err(RunFailure::new(
            FailureKind::StaleOtp,
            format!(
                "verification code never arrived fresh within {} attempts (last: {last_seen})",
                retry.max_attempts
            ),
        ))
    }

    async fn capture(&self, run: &mut AutomationRun, url: &str) -> Result<(), RunFailure> {
        let settled = wait_for_quiescence(
            &self.tap,
            self.settings.quiescence_idle,
            self.settings.quiescence_max,
        )
        .await;
        run.absorb(&self.tap.snapshot());

        match self.bounded("read storage", self.page.read_storage()).await {
            Ok(entries) => {
                let tokens = storage::harvest(&entries, self.tap.min_token_length());
                tracing::debug!(
                    has_access_token = tokens.access_token.is_some(),
                    has_refresh_token = tokens.refresh_token.is_some(),
                    "Read browser storage"
                );
                run.absorb_storage(&tokens);
            }
            Err(e) => tracing::warn!(error = %e, "Could not read browser storage"),
        }

        tracing::info!(
            settled,
            requests_observed = run.requests_observed(),
            session_token = ?run.session_token().map(preview),
            "Capture window closed"
        );

        if run.session_token().is_some() {
            return Ok(());
        }
        if run.requests_observed() == 0 {
            return Err(RunFailure::new(
                FailureKind::NoRequestsObserved,
                "the network tap saw no requests; it was not attached or the page issued none",
            ));
        }
        Err(RunFailure::new(
            FailureKind::SilentAuthFailure,
            format!(
                "{} requests observed after loading {url} but none carried a session token",
                run.requests_observed()
            ),
        ))
    }

    async fn create_integration(&self, run: &mut AutomationRun, request: &IntegrationRequest) {
        if let Err(e) = run.advance(RunStatus::CreatingSecondaryToken) {
            tracing::warn!(error = %e, "Skipping integration token");
            return;
        }

        let limit = self.settings.navigation_timeout * 2;
        match bounded(
            "create integration token",
            limit,
            self.page.create_integration_token(request),
        )
        .await
        {
            Ok(Some(token)) => {
                tracing::info!(token_prefix = preview(&token), "Integration token created");
                run.integration_token = Some(token);
            }
            Ok(None) => {
                run.integration_error =
                    Some("integration flow finished without a readable token".to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Integration token creation failed");
                run.integration_error = Some(e.to_string());
            }
        }

        if let Err(e) = run.advance(RunStatus::Completed) {
            tracing::error!(error = %e, "Could not return run to completed");
        }
    }

    /// Best-effort capture of the page a run failed on.
    async fn save_screenshot(&self, run: &AutomationRun, dir: &Path) {
        let png = match self.bounded("screenshot", self.page.screenshot()).await {
            Ok(png) => png,
            Err(e) => {
                tracing::warn!(error = %e, "Could not take failure screenshot");
                return;
            }
        };
        let path = dir.join(format!("{}.png", run.id));
        let written: std::io::Result<()> = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, &png).await
        }
        .await;
        match written {
            Ok(()) => tracing::info!(path = %path.display(), "Saved failure screenshot"),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not write failure screenshot"
            ),
        }
    }

    async fn navigate(&self, url: &str) -> Result<(), RunFailure> {
        tracing::info!(%url, "Navigating");
        self.bounded("navigate", self.page.navigate(url))
            .await
            .map_err(|e| page_failure(FailureKind::Navigation, e))
    }

    async fn bounded<T>(
        &self,
        action: &'static str,
        fut: impl Future<Output = Result<T, PageError>>,
    ) -> Result<T, PageError> {
        bounded(action, self.settings.navigation_timeout, fut).await
    }
}

async fn bounded<T>(
    action: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, PageError>>,
) -> Result<T, PageError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PageError::Timeout {
            action,
            after: limit,
        }),
    }
}

/// Timeouts are always reported as such; other errors take the step's kind.
fn page_failure(kind: FailureKind, error: PageError) -> RunFailure {
    let kind = if error.is_timeout() {
        FailureKind::NavigationTimeout
    } else {
        kind
    };
    RunFailure::new(kind, error.to_string())
}

/// Wait until the tap's request counter has not moved for `idle`, or `max`
/// has elapsed. Returns whether the network actually went quiet.
pub async fn wait_for_quiescence(tap: &NetworkTap, idle: Duration, max: Duration) -> bool {
    let deadline = Instant::now() + max;
    let mut last_count = tap.requests_observed();
    let mut last_change = Instant::now();

    loop {
        let now = Instant::now();
        if now.duration_since(last_change) >= idle {
            return true;
        }
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(QUIESCENCE_POLL.min(idle)).await;

        let count = tap.requests_observed();
        if count != last_count {
            last_count = count;
            last_change = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tap::RequestHeaders;

    #[test]
    fn derived_budget_covers_otp_schedule() {
        let settings = RunSettings {
            navigation_timeout: Duration::from_secs(10),
            challenge_window: Duration::from_secs(8),
            quiescence_idle: Duration::from_secs(2),
            quiescence_max: Duration::from_secs(20),
            retry: RetryPolicy::new(30, Duration::from_secs(1)),
            budget: None,
            integration: None,
            screenshot_dir: None,
        };
        // 29 * 1s + 30 * 5s + 5 * 10s + 8s + 20s
        assert_eq!(settings.budget(), Duration::from_secs(29 + 150 + 50 + 8 + 20));

        let explicit = RunSettings {
            budget: Some(Duration::from_secs(90)),
            ..settings
        };
        assert_eq!(explicit.budget(), Duration::from_secs(90));
    }

    #[test]
    fn timeouts_map_to_navigation_timeout() {
        let timeout = PageError::Timeout {
            action: "navigate",
            after: Duration::from_secs(1),
        };
        assert_eq!(
            page_failure(FailureKind::LoginForm, timeout).kind,
            FailureKind::NavigationTimeout
        );
        assert_eq!(
            page_failure(FailureKind::LoginForm, PageError::NotFound("email".into())).kind,
            FailureKind::LoginForm
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quiescence_waits_for_idle_counter() {
        let tap = Arc::new(NetworkTap::default());
        let feeder = {
            let tap = tap.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    tap.observe_request(&RequestHeaders::new());
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            })
        };

        let start = Instant::now();
        let settled =
            wait_for_quiescence(&tap, Duration::from_millis(500), Duration::from_secs(10)).await;
        assert!(settled);
        assert!(start.elapsed() >= Duration::from_millis(1500));
        feeder.await.unwrap();
        assert_eq!(tap.requests_observed(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn quiescence_gives_up_at_max() {
        let tap = Arc::new(NetworkTap::default());
        let feeder = {
            let tap = tap.clone();
            tokio::spawn(async move {
                loop {
                    tap.observe_request(&RequestHeaders::new());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
        };

        let settled =
            wait_for_quiescence(&tap, Duration::from_millis(500), Duration::from_secs(2)).await;
        assert!(!settled);
        feeder.abort();
    }
}
