//! Credentials the web app keeps in browser storage.
//!
//! Request headers only carry the short-lived access token. The refresh
//! token lives in `localStorage`, either in a packed entry (base64 JSON under
//! the key `a`) or in token-named entries holding JSON or a bare value.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::token::pad_segment;

/// Key of the packed base64 JSON entry.
const PACKED_KEY: &str = "a";

/// Raw key/value pairs read from the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StorageEntries {
    #[serde(default)]
    pub local: Vec<(String, String)>,
    #[serde(default)]
    pub session: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl StorageTokens {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }

    fn offer_access(&mut self, value: Option<&str>, min_len: usize) {
        if self.access_token.is_none() {
            self.access_token = value.filter(|v| v.len() > min_len).map(str::to_string);
        }
    }

    fn offer_refresh(&mut self, value: Option<&str>, min_len: usize) {
        if self.refresh_token.is_none() {
            self.refresh_token = value.filter(|v| v.len() > min_len).map(str::to_string);
        }
    }
}

/// Pull access and refresh tokens out of storage entries.
///
/// Every value is set at most once. The packed entry is read first, then
/// token-named `localStorage` entries, then token-named `sessionStorage`
/// entries. A bare (non-JSON) `localStorage` value counts as an access token
/// when it is longer than `min_token_length` and has no whitespace.
pub fn harvest(entries: &StorageEntries, min_token_length: usize) -> StorageTokens {
    let mut tokens = StorageTokens::default();

    if let Some(packed) = entries
        .local
        .iter()
        .find(|(key, value)| key == PACKED_KEY && !value.is_empty())
        .and_then(|(_, value)| unpack(value))
    {
        for field in ["refreshToken", "refreshJwt"] {
            tokens.offer_refresh(str_field(&packed, field), min_token_length);
        }
        for field in ["authToken", "jwt"] {
            tokens.offer_access(str_field(&packed, field), min_token_length);
        }
    }

    for (store, bare_values) in [(&entries.local, true), (&entries.session, false)] {
        for (key, value) in store.iter().filter(|(key, _)| is_token_key(key)) {
            match serde_json::from_str::<Value>(value) {
                Ok(Value::Object(object)) => {
                    tokens.offer_access(str_field(&object, "access_token"), min_token_length);
                    tokens.offer_refresh(str_field(&object, "refresh_token"), min_token_length);
                }
                Ok(_) => {}
                Err(_) if bare_values && !value.contains(char::is_whitespace) => {
                    tracing::debug!(%key, "Treating bare storage value as access token");
                    tokens.offer_access(Some(value), min_token_length);
                }
                Err(_) => {}
            }
        }
    }

    tokens
}

fn is_token_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("token") || key.contains("access")
}

fn unpack(value: &str) -> Option<Map<String, Value>> {
    let padded = pad_segment(value.trim());
    let bytes = STANDARD
        .decode(&padded)
        .or_else(|_| URL_SAFE.decode(&padded))
        .ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(object)) => Some(object),
        _ => {
            tracing::debug!("Packed storage entry is not a JSON object");
            None
        }
    }
}

fn str_field<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    object.get(field).and_then(Value::as_str)
}
