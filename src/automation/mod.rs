//! The login-and-capture engine.
//!
//! [`LoginOrchestrator`] drives a [`LoginPage`] through the login state
//! machine while a [`NetworkTap`](crate::tap::NetworkTap) records
//! credentials, then [`ResultReporter`] turns the finished
//! [`AutomationRun`] into an [`AutomationResult`] for the caller.

mod orchestrator;
mod page;
mod report;
mod run;
mod sink;

pub use orchestrator::{wait_for_quiescence, LoginOrchestrator, RunSettings};
pub use page::{IntegrationRequest, LoginPage, PageError};
pub use report::{AutomationResult, ResultReporter};
pub use run::{
    AutomationRun, FailureKind, RunFailure, RunStatus, Target, TransitionError,
};
#[cfg(feature = "automation")]
pub use sink::HttpSink;
pub use sink::{JsonFileSink, ResultSink};

use anyhow::Result;

use crate::config::ReportConfig;

/// Build the configured result sink, if any.
pub fn build_sink(report: &ReportConfig) -> Result<Option<Box<dyn ResultSink>>> {
    let sink: Option<Box<dyn ResultSink>> = match report {
        ReportConfig::None => None,
        ReportConfig::File { dir } => Some(Box::new(JsonFileSink::with_path(dir)?)),
        #[cfg(feature = "automation")]
        ReportConfig::Http { url, timeout } => {
            Some(Box::new(HttpSink::new(url.clone(), *timeout)?))
        }
        #[cfg(not(feature = "automation"))]
        ReportConfig::Http { .. } => {
            anyhow::bail!("HTTP result delivery requires the `automation` feature")
        }
    };
    Ok(sink)
}

#[cfg(feature = "automation")]
pub use live::run_automation;

#[cfg(feature = "automation")]
mod live {
    use std::sync::Arc;

    use anyhow::Result;
    use secrecy::SecretString;

    use crate::browser::{BrowserSession, ChromeLoginPage};
    use crate::config::Config;
    use crate::credentials::{CredentialStore, MAILBOX_PASSWORD};
    use crate::mail::{CodeExtractor, ImapMailbox, ImapSettings, MailPoller, MatchRule};
    use crate::tap::NetworkTap;

    use super::{
        build_sink, AutomationResult, AutomationRun, FailureKind, LoginOrchestrator,
        ResultReporter, RunFailure, RunSettings, Target,
    };

    /// Run the whole flow against a real browser and mailbox.
    ///
    /// Returns `Err` only for setup problems that precede the run (bad
    /// configuration, missing mailbox secret). Everything after that,
    /// including a browser that fails to start, is reported in the result.
    pub async fn run_automation(
        config: &Config,
        store: &dyn CredentialStore,
        target: &Target,
    ) -> Result<AutomationResult> {
        let reporter = match build_sink(&config.report)? {
            Some(sink) => ResultReporter::with_sink(sink),
            None => ResultReporter::new(),
        };

        let poller = build_poller(config, store, target).await?;
        let tap = Arc::new(NetworkTap::new(config.run.min_token_length));

        let session = match BrowserSession::launch(&config.browser, tap.clone()).await {
            Ok(session) => session,
            Err(e) => {
                let mut run = AutomationRun::new(target);
                run.fail(RunFailure::new(FailureKind::BrowserSetup, format!("{e:#}")));
                return Ok(reporter.report(&run).await);
            }
        };

        let page = ChromeLoginPage::new(
            session.page().clone(),
            config.selectors.clone(),
            config.target.login_url_markers.clone(),
            config.browser.navigation_timeout / 2,
        );
        let orchestrator =
            LoginOrchestrator::new(&page, &poller, tap, RunSettings::from_config(config));
        let run = orchestrator.run(target).await;

        session.close().await;
        Ok(reporter.report(&run).await)
    }

    async fn build_poller(
        config: &Config,
        store: &dyn CredentialStore,
        target: &Target,
    ) -> Result<MailPoller<ImapMailbox>> {
        let mail = &config.mail;
        let password: SecretString = store.require(MAILBOX_PASSWORD).await?;

        let mailbox = ImapMailbox::new(ImapSettings {
            host: mail.host.clone(),
            port: mail.port,
            username: mail.username.clone().unwrap_or_else(|| target.email.clone()),
            password,
            folder: mail.folder.clone(),
            lookback_days: mail.lookback_days,
            mark_seen: mail.mark_seen,
        });
        let extractor = if mail.code_patterns.is_empty() {
            CodeExtractor::default()
        } else {
            CodeExtractor::new(&mail.code_patterns)?
        };

        Ok(MailPoller::new(
            mailbox,
            MatchRule {
                sender: mail.sender.clone(),
                subject: mail.subject.clone(),
            },
        )
        .with_extractor(extractor)
        .with_freshness(mail.freshness))
    }
}
