//! Chrome lifecycle and the network tap wiring.
//!
//! A [`BrowserSession`] owns one browser process, one page, and the
//! background tasks that feed that page's outbound requests into a
//! [`NetworkTap`]. The tap is attached before the first navigation.

mod page;

pub use page::ChromeLoginPage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, EventRequestPaused, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventRequestWillBeSent, EventRequestWillBeSentExtraInfo,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::automation::PageError;
use crate::config::{BrowserConfig, TapMode};
use crate::tap::{NetworkTap, RequestHeaders};

/// How long `close` waits for the browser process to exit.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

impl From<CdpError> for PageError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::Timeout => PageError::Timeout {
                action: "browser command",
                after: Duration::ZERO,
            },
            other => PageError::Browser(other.to_string()),
        }
    }
}

pub struct BrowserSession {
    browser: Browser,
    page: Page,
    tasks: Vec<JoinHandle<()>>,
}

impl BrowserSession {
    /// Launch Chrome, open a page, and attach `tap` to it.
    ///
    /// Without a profile directory the page lives in a fresh browser
    /// context, so no cookies leak between runs. With one, the default
    /// context is used so a previously authenticated session is reused.
    pub async fn launch(config: &BrowserConfig, tap: Arc<NetworkTap>) -> Result<Self> {
        let chrome_path = match &config.chrome_path {
            Some(path) => path.clone(),
            None => find_chrome().map(PathBuf::from).context(
                "Chrome/Chromium not found. Install it or set browser.chrome_path.",
            )?,
        };

        let mut builder = ChromeConfig::builder()
            .chrome_executable(chrome_path)
            .viewport(None)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(dir) = &config.user_data_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create profile dir: {}", dir.display()))?;
            builder = builder.user_data_dir(dir);
        }
        for arg in &config.args {
            builder = builder.arg(arg.as_str());
        }
        let chrome_config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to configure browser: {e}"))?;

        let (mut browser, mut handler) = Browser::launch(chrome_config)
            .await
            .context("Failed to launch browser")?;
        let handler_task = tokio::spawn(async move { while (handler.next().await).is_some() {} });

        let page = match open_page(&mut browser, config.user_data_dir.is_none()).await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler_task.abort();
                return Err(e);
            }
        };

        let mut session = Self {
            browser,
            page,
            tasks: vec![handler_task],
        };
        // On error the session drops here, which tears the browser down.
        session.attach_tap(config.tap_mode, tap).await?;

        tracing::info!(
            headless = config.headless,
            tap_mode = ?config.tap_mode,
            profile = ?config.user_data_dir,
            "Browser session ready"
        );
        Ok(session)
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn attach_tap(&mut self, mode: TapMode, tap: Arc<NetworkTap>) -> Result<()> {
        match mode {
            TapMode::Observe => {
                let mut sent = self
                    .page
                    .event_listener::<EventRequestWillBeSent>()
                    .await
                    .context("Failed to subscribe to requests")?;
                let mut extra = self
                    .page
                    .event_listener::<EventRequestWillBeSentExtraInfo>()
                    .await
                    .context("Failed to subscribe to request headers")?;

                let sent_tap = tap.clone();
                self.tasks.push(tokio::spawn(async move {
                    while let Some(event) = sent.next().await {
                        sent_tap.observe_request(&RequestHeaders::from_json(
                            event.request.headers.inner(),
                        ));
                    }
                }));
                self.tasks.push(tokio::spawn(async move {
                    while let Some(event) = extra.next().await {
                        tap.observe_extra_headers(&RequestHeaders::from_json(
                            event.headers.inner(),
                        ));
                    }
                }));

                self.page
                    .execute(network::EnableParams::default())
                    .await
                    .context("Failed to enable network events")?;
            }
            TapMode::Intercept => {
                let mut paused = self
                    .page
                    .event_listener::<EventRequestPaused>()
                    .await
                    .context("Failed to subscribe to paused requests")?;

                let page = self.page.clone();
                self.tasks.push(tokio::spawn(async move {
                    while let Some(event) = paused.next().await {
                        tap.observe_request(&RequestHeaders::from_json(
                            event.request.headers.inner(),
                        ));
                        let resumed = page
                            .execute(fetch::ContinueRequestParams {
                                request_id: event.request_id.clone(),
                                url: None,
                                method: None,
                                post_data: None,
                                headers: None,
                                intercept_response: None,
                            })
                            .await;
                        if let Err(e) = resumed {
                            tracing::debug!(error = %e, "Failed to continue paused request");
                        }
                    }
                }));

                self.page
                    .execute(fetch::EnableParams {
                        patterns: Some(vec![RequestPattern {
                            url_pattern: Some("*".to_string()),
                            resource_type: None,
                            request_stage: Some(RequestStage::Request),
                        }]),
                        handle_auth_requests: None,
                    })
                    .await
                    .context("Failed to enable request interception")?;
            }
        }
        Ok(())
    }

    /// Close the browser and stop every background task.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::warn!(error = %e, "Browser did not acknowledge close");
        }
        match tokio::time::timeout(CLOSE_GRACE, self.browser.wait()).await {
            Ok(Ok(_)) => tracing::debug!("Browser process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed waiting for browser exit"),
            Err(_) => {
                tracing::warn!("Browser still running after close, killing it");
                if let Some(Err(e)) = self.browser.kill().await {
                    tracing::warn!(error = %e, "Failed to kill browser");
                }
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn open_page(browser: &mut Browser, isolated: bool) -> Result<Page> {
    if !isolated {
        return browser
            .new_page("about:blank")
            .await
            .context("Failed to open page");
    }

    let context_id = browser
        .create_browser_context(CreateBrowserContextParams::default())
        .await
        .context("Failed to create browser context")?;
    let params = CreateTargetParams::builder()
        .url("about:blank")
        .browser_context_id(context_id)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build target params: {e}"))?;
    browser
        .new_page(params)
        .await
        .context("Failed to open page in isolated context")
}

/// Find a Chrome/Chromium executable on PATH or in the usual install locations.
pub fn find_chrome() -> Option<String> {
    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(output) = std::process::Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(path);
                }
            }
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/run/current-system/sw/bin/google-chrome",
        "/run/current-system/sw/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];
    candidates
        .into_iter()
        .find(|candidate| std::path::Path::new(candidate).exists())
        .map(str::to_string)
}
