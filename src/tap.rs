//! Passive capture of bearer credentials from outbound request headers.
//!
//! A [`NetworkTap`] is created per run and shared (behind an `Arc`) with the
//! browser event listener. It only reads headers: every request it sees is
//! allowed to continue unmodified, and each captured value is set at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde_json::Value;

use crate::token;

/// Header carrying the JWT-shaped session token.
pub const SESSION_TOKEN_HEADER: &str = "token-id";

/// Header carrying the bearer access token.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Default minimum length for a captured value to be considered real.
pub const DEFAULT_MIN_TOKEN_LENGTH: usize = 20;

/// Case-insensitive view of a request's headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    inner: HashMap<String, String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.inner.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Build from a DevTools header object. Non-string values are ignored.
    pub fn from_json(value: &Value) -> Self {
        let mut headers = Self::new();
        if let Some(obj) = value.as_object() {
            for (name, value) in obj {
                if let Some(value) = value.as_str() {
                    headers.insert(name, value);
                }
            }
        }
        headers
    }
}

/// What the tap tells the request pipeline to do. There is only one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapVerdict {
    Continue,
}

/// Point-in-time copy of everything the tap has captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub access_token: Option<String>,
    pub session_token: Option<String>,
    pub subject_id: Option<String>,
    pub requests_observed: u64,
}

#[derive(Debug)]
pub struct NetworkTap {
    min_token_length: usize,
    access_token: OnceLock<String>,
    session_token: OnceLock<String>,
    subject_id: OnceLock<String>,
    requests_observed: AtomicU64,
}

impl Default for NetworkTap {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_TOKEN_LENGTH)
    }
}

impl NetworkTap {
    pub fn new(min_token_length: usize) -> Self {
        Self {
            min_token_length,
            access_token: OnceLock::new(),
            session_token: OnceLock::new(),
            subject_id: OnceLock::new(),
            requests_observed: AtomicU64::new(0),
        }
    }

    /// Observe one outbound request. Counts it, then inspects its headers.
    pub fn observe_request(&self, headers: &RequestHeaders) -> TapVerdict {
        self.requests_observed.fetch_add(1, Ordering::Relaxed);
        self.inspect(headers)
    }

    /// Inspect a supplementary header set for a request already counted
    /// (e.g. the extra-info headers the browser adds after the fact).
    pub fn observe_extra_headers(&self, headers: &RequestHeaders) -> TapVerdict {
        self.inspect(headers)
    }

    fn inspect(&self, headers: &RequestHeaders) -> TapVerdict {
        if self.access_token.get().is_none() {
            if let Some(token) = headers.get(AUTHORIZATION_HEADER).and_then(strip_bearer) {
                if token.len() > self.min_token_length
                    && self.access_token.set(token.to_string()).is_ok()
                {
                    tracing::info!(
                        token_prefix = preview(token),
                        request = self.requests_observed(),
                        "Captured bearer access token"
                    );
                }
            }
        }

        if self.session_token.get().is_none() {
            if let Some(value) = headers.get(SESSION_TOKEN_HEADER).map(str::trim) {
                if value.len() > self.min_token_length
                    && self.session_token.set(value.to_string()).is_ok()
                {
                    tracing::info!(
                        token_prefix = preview(value),
                        request = self.requests_observed(),
                        "Captured session token"
                    );
                    self.derive_subject(value);
                }
            }
        }

        TapVerdict::Continue
    }

    fn derive_subject(&self, session_token: &str) {
        if self.subject_id.get().is_some() {
            return;
        }
        match token::subject_id(session_token) {
            Ok(subject) => {
                let _ = self.subject_id.set(subject);
            }
            Err(e) => tracing::warn!(error = %e, "Session token payload could not be decoded"),
        }
    }

    /// Shortest value accepted as a credential.
    pub fn min_token_length(&self) -> usize {
        self.min_token_length
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.get().map(String::as_str)
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.get().map(String::as_str)
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.get().map(String::as_str)
    }

    pub fn requests_observed(&self) -> u64 {
        self.requests_observed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            access_token: self.access_token().map(str::to_string),
            session_token: self.session_token().map(str::to_string),
            subject_id: self.subject_id().map(str::to_string),
            requests_observed: self.requests_observed(),
        }
    }
}

/// Strip a case-insensitive `Bearer ` scheme prefix.
fn strip_bearer(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(char::is_whitespace)?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = rest.trim();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}

/// Short, log-safe prefix of a credential.
pub fn preview(token: &str) -> String {
    let end = token
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    format!("{}...", &token[..end])
}
