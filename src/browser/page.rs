//! Placeholder- and label-driven [`LoginPage`] over a Chrome page.
//!
//! Controls are located by their visible text rather than by ids or class
//! names, which the target renames freely. All lookups run as small
//! synchronous scripts; waiting happens on the Rust side.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::time::Instant;

use crate::automation::{IntegrationRequest, LoginPage, PageError};
use crate::config::SelectorConfig;
use crate::storage::StorageEntries;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shared DOM helpers prepended to every script.
const HELPERS: &str = r#"
const visible = (el) => !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
const setValue = (el, value) => {
  el.focus();
  const desc = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value');
  if (desc && desc.set) { desc.set.call(el, value); } else { el.value = value; }
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
};
const byPlaceholder = (needles) => {
  const inputs = Array.from(document.querySelectorAll('input, textarea')).filter(visible);
  for (const needle of needles) {
    const hit = inputs.find((el) => (el.getAttribute('placeholder') || '').toLowerCase().includes(needle));
    if (hit) return hit;
  }
  return null;
};
const controlText = (el) => (el.innerText || el.value || el.getAttribute('aria-label') || '').trim().toLowerCase();
const byText = (labels) => {
  const controls = Array.from(document.querySelectorAll('button, [role="button"], a, input[type="submit"]')).filter(visible);
  for (const label of labels) {
    const hit = controls.find((el) => controlText(el) === label)
      || controls.find((el) => controlText(el).includes(label));
    if (hit) return hit;
  }
  return null;
};
const pageText = () => (document.body ? document.body.innerText : '').toLowerCase();
"#;

/// Storage can throw on opaque origins; an unreadable store reads as empty.
const DUMP_STORAGE: &str = r#"
const dump = (open) => {
  const out = [];
  try {
    const store = open();
    for (let i = 0; i < store.length; i++) {
      const key = store.key(i);
      out.push([key, store.getItem(key) || '']);
    }
  } catch (e) {}
  return out;
};
return { local: dump(() => window.localStorage), session: dump(() => window.sessionStorage) };
"#;

pub struct ChromeLoginPage {
    page: Page,
    selectors: SelectorConfig,
    login_url_markers: Vec<String>,
    /// How long to wait for an expected element before giving up on it.
    element_wait: Duration,
}

impl ChromeLoginPage {
    pub fn new(
        page: Page,
        selectors: SelectorConfig,
        login_url_markers: Vec<String>,
        element_wait: Duration,
    ) -> Self {
        Self {
            page,
            selectors,
            login_url_markers,
            element_wait,
        }
    }

    async fn eval<T: DeserializeOwned>(&self, body: &str) -> Result<T, PageError> {
        let params = EvaluateParams::builder()
            .expression(format!("(() => {{ {HELPERS}\n{body} }})()"))
            .return_by_value(true)
            .build()
            .map_err(PageError::Browser)?;
        self.page
            .evaluate_expression(params)
            .await?
            .into_value::<T>()
            .map_err(|e| PageError::Browser(format!("unexpected script result: {e}")))
    }

    /// Re-run a boolean script until it holds or `within` elapses.
    async fn wait_until(&self, body: &str, within: Duration) -> Result<bool, PageError> {
        let deadline = Instant::now() + within;
        loop {
            if self.eval::<bool>(body).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn click_labelled(&self, labels: &[String]) -> Result<bool, PageError> {
        self.eval(&format!(
            "const el = byText({}); if (!el) return false; el.click(); return true;",
            lowered(labels)
        ))
        .await
    }

    async fn digit_input_count(&self) -> Result<usize, PageError> {
        self.eval(&format!(
            "return Array.from(document.querySelectorAll({})).filter(visible).length;",
            json!(self.selectors.digit_input)
        ))
        .await
    }
}

fn lowered(items: &[String]) -> String {
    json!(items.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>()).to_string()
}

#[async_trait]
impl LoginPage for ChromeLoginPage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn is_login_page(&self) -> Result<bool, PageError> {
        let url = self.current_url().await?.to_lowercase();
        if self
            .login_url_markers
            .iter()
            .any(|marker| url.contains(&marker.to_lowercase()))
        {
            return Ok(true);
        }
        // Client-side redirects can render the form before the URL changes.
        self.wait_until(
            "return Array.from(document.querySelectorAll('input[type=\"password\"]')).some(visible);",
            POLL_INTERVAL * 4,
        )
        .await
    }

    async fn fill_credentials(&self, email: &str, password: &str) -> Result<(), PageError> {
        let email_needles = lowered(&self.selectors.email_placeholders);
        let password_needles = lowered(&self.selectors.password_placeholders);

        let ready = format!(
            "return !!byPlaceholder({email_needles}) && !!byPlaceholder({password_needles});"
        );
        if !self.wait_until(&ready, self.element_wait).await? {
            return Err(PageError::NotFound(format!(
                "credential fields with placeholders {email_needles} / {password_needles}"
            )));
        }

        let filled: bool = self
            .eval(&format!(
                "const email = byPlaceholder({email_needles});
                 const password = byPlaceholder({password_needles});
                 if (!email || !password) return false;
                 setValue(email, {});
                 setValue(password, {});
                 return true;",
                json!(email),
                json!(password)
            ))
            .await?;
        if !filled {
            return Err(PageError::NotFound("credential fields disappeared".to_string()));
        }
        Ok(())
    }

    async fn submit_login(&self) -> Result<(), PageError> {
        if self.click_labelled(&self.selectors.sign_in_labels).await? {
            return Ok(());
        }
        let submitted: bool = self
            .eval(
                "const el = Array.from(document.querySelectorAll('button[type=\"submit\"], input[type=\"submit\"]')).find(visible);
                 if (!el) return false; el.click(); return true;",
            )
            .await?;
        if submitted {
            Ok(())
        } else {
            Err(PageError::NotFound(format!(
                "sign-in control labelled {:?}",
                self.selectors.sign_in_labels
            )))
        }
    }

    async fn has_secondary_challenge(&self, window: Duration) -> Result<bool, PageError> {
        let check = format!(
            "const digits = Array.from(document.querySelectorAll({})).filter(visible).length;
             if (digits > 0) return true;
             if (byText({})) return true;
             const text = pageText();
             const passwordShown = Array.from(document.querySelectorAll('input[type=\"password\"]')).some(visible);
             return !passwordShown && {}.some((m) => text.includes(m));",
            json!(self.selectors.digit_input),
            lowered(&self.selectors.send_code_labels),
            lowered(&self.selectors.challenge_markers)
        );
        self.wait_until(&check, window).await
    }

    async fn request_code(&self) -> Result<bool, PageError> {
        if !self.click_labelled(&self.selectors.send_code_labels).await? {
            return Ok(false);
        }
        let check = format!(
            "return Array.from(document.querySelectorAll({})).some(visible);",
            json!(self.selectors.digit_input)
        );
        if !self.wait_until(&check, self.element_wait).await? {
            tracing::warn!("Code inputs did not appear after requesting a code");
        }
        Ok(true)
    }

    async fn submit_digits(&self, code: &str) -> Result<(), PageError> {
        let needed = code.chars().count();
        let deadline = Instant::now() + self.element_wait;
        let mut found = self.digit_input_count().await?;
        while found < needed && Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            found = self.digit_input_count().await?;
        }
        if found < needed {
            return Err(PageError::NotFound(format!(
                "{needed} code inputs matching {} (found {found})",
                self.selectors.digit_input
            )));
        }

        let digits: Vec<String> = code.chars().map(String::from).collect();
        let filled: bool = self
            .eval(&format!(
                "const inputs = Array.from(document.querySelectorAll({})).filter(visible);
                 const digits = {};
                 if (inputs.length < digits.length) return false;
                 digits.forEach((d, i) => {{
                   setValue(inputs[i], d);
                   inputs[i].dispatchEvent(new KeyboardEvent('keyup', {{ key: d, bubbles: true }}));
                 }});
                 return true;",
                json!(self.selectors.digit_input),
                json!(digits)
            ))
            .await?;
        if !filled {
            return Err(PageError::NotFound("code inputs disappeared".to_string()));
        }

        // Many forms submit on the last digit; the button is a fallback.
        self.click_labelled(&self.selectors.verify_labels).await?;

        let gone = format!(
            "return !Array.from(document.querySelectorAll({})).some(visible);",
            json!(self.selectors.digit_input)
        );
        if !self.wait_until(&gone, self.element_wait).await? {
            tracing::warn!("Code inputs still shown after submitting the code");
        }
        Ok(())
    }

    async fn read_storage(&self) -> Result<StorageEntries, PageError> {
        self.eval(DUMP_STORAGE).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn create_integration_token(
        &self,
        request: &IntegrationRequest,
    ) -> Result<Option<String>, PageError> {
        let create_labels = lowered(&["create new integration".to_string(), "create new".to_string()]);
        let opened = self
            .wait_until(
                &format!("const el = byText({create_labels}); if (!el) return false; el.click(); return true;"),
                self.element_wait,
            )
            .await?;
        if !opened {
            return Err(PageError::NotFound("create-integration control".to_string()));
        }

        let named: bool = self
            .wait_until(
                &format!(
                    "const el = document.querySelector('input[name=\"name\"]') || byPlaceholder(['name']);
                     if (!el) return false; setValue(el, {}); return true;",
                    json!(request.name)
                ),
                self.element_wait,
            )
            .await?;
        if !named {
            return Err(PageError::NotFound("integration name field".to_string()));
        }
        self.click_labelled(&["next".to_string(), "continue".to_string()]).await?;
        tokio::time::sleep(POLL_INTERVAL * 4).await;

        for scope in &request.scopes {
            let typed: bool = self
                .eval(&format!(
                    "const el = byPlaceholder(['search', 'scope']); if (!el) return false; setValue(el, {}); return true;",
                    json!(scope)
                ))
                .await?;
            if !typed {
                return Err(PageError::NotFound("scope search field".to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL * 2).await;

            let picked: bool = self
                .eval(&format!(
                    "const want = {};
                     const options = Array.from(document.querySelectorAll('[role=\"option\"], li')).filter(visible);
                     const hit = options.find((el) => el.innerText.trim().toLowerCase() === want)
                       || options.find((el) => el.innerText.toLowerCase().includes(want));
                     if (hit) {{ hit.click(); return true; }}
                     const input = byPlaceholder(['search', 'scope']);
                     if (!input) return false;
                     input.dispatchEvent(new KeyboardEvent('keydown', {{ key: 'Enter', code: 'Enter', keyCode: 13, bubbles: true }}));
                     return true;",
                    json!(scope.to_lowercase())
                ))
                .await?;
            if !picked {
                tracing::warn!(%scope, "Scope could not be selected");
            }
        }

        if !self.click_labelled(&["create".to_string()]).await? {
            return Err(PageError::NotFound("create control".to_string()));
        }

        let deadline = Instant::now() + self.element_wait;
        loop {
            // Scripts return "" rather than null; a null result carries no value.
            let token: String = self
                .eval(
                    "const pattern = /pit-[0-9a-f-]{8,}/i;
                     for (const el of document.querySelectorAll('pre, code, textarea, input[readonly]')) {
                       const m = (el.value || el.innerText || '').match(pattern);
                       if (m) return m[0];
                     }
                     const m = pageText().match(pattern);
                     return m ? m[0] : '';",
                )
                .await?;
            if !token.is_empty() {
                return Ok(Some(token));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
