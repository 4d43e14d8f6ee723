//! Decoding of JWT-shaped session credentials.
//!
//! The payload segment is decoded and parsed, but the signature is never
//! verified: no key material is available to the automation. Decoded claims
//! are informational only and must not be treated as trusted.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Claim holding the subject identifier in the target's session tokens.
pub const SUBJECT_CLAIM: &str = "user_id";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected 3 dot-separated segments, found {0}")]
    Segments(usize),
    #[error("payload segment is not valid base64url: {0}")]
    Base64(String),
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("payload is not a JSON object: {0}")]
    Json(String),
    #[error("payload has no usable {0:?} claim")]
    MissingClaim(&'static str),
}

/// Claims read from a token payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub subject: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub raw: Map<String, Value>,
}

/// Number of `=` characters needed to pad a base64url segment of `len` characters.
pub fn padding_len(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Append the padding a base64url segment needs before strict decoding.
pub fn pad_segment(segment: &str) -> String {
    let mut padded = String::with_capacity(segment.len() + 3);
    padded.push_str(segment);
    padded.extend(std::iter::repeat('=').take(padding_len(segment.len())));
    padded
}

/// Decode the payload segment of a three-part token into its claims.
pub fn decode_claims(token: &str) -> Result<Claims, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::Segments(segments.len()));
    }

    let bytes = URL_SAFE
        .decode(pad_segment(segments[1]))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|_| DecodeError::Utf8)?;

    let raw = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map,
        Ok(other) => return Err(DecodeError::Json(format!("found {}", type_name(&other)))),
        Err(e) => return Err(DecodeError::Json(e.to_string())),
    };

    Ok(Claims {
        subject: raw.get(SUBJECT_CLAIM).and_then(claim_as_string),
        issued_at: raw.get("iat").and_then(claim_as_timestamp),
        expires_at: raw.get("exp").and_then(claim_as_timestamp),
        raw,
    })
}

/// Extract the subject identifier from a session token.
pub fn subject_id(token: &str) -> Result<String, DecodeError> {
    decode_claims(token)?
        .subject
        .ok_or(DecodeError::MissingClaim(SUBJECT_CLAIM))
}

fn claim_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn claim_as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let secs = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))?;
    Utc.timestamp_opt(secs, 0).single()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::json;

    fn token_with_payload(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.signature")
    }

    #[test]
    fn decodes_known_session_token() {
        let token = "eyJhbGciOiJSUzI1NiJ9.eyJ1c2VyX2lkIjoiYWJjIn0.sig";
        assert_eq!(subject_id(token), Ok("abc".to_string()));
    }

    #[test]
    fn padding_length_for_every_remainder() {
        for len in 0..64 {
            let pad = padding_len(len);
            assert!(pad < 4);
            assert_eq!((len + pad) % 4, 0, "len {len} padded by {pad}");
            assert_eq!(pad_segment(&"A".repeat(len)).len(), len + pad);
        }
        assert_eq!(padding_len(26), 2);
        assert_eq!(padding_len(27), 1);
        assert_eq!(padding_len(28), 0);
    }

    #[test]
    fn claims_survive_encode_and_decode() {
        let payload = json!({
            "user_id": "u-123",
            "iat": 1_760_000_000,
            "exp": 1_760_003_600,
            "company_id": "c-9",
            "nested": {"roles": ["admin"]},
        });

        let claims = decode_claims(&token_with_payload(&payload)).unwrap();

        assert_eq!(Value::Object(claims.raw.clone()), payload);
        assert_eq!(claims.subject.as_deref(), Some("u-123"));
        assert_eq!(claims.issued_at.map(|t| t.timestamp()), Some(1_760_000_000));
        assert_eq!(claims.expires_at.map(|t| t.timestamp()), Some(1_760_003_600));
    }

    #[test]
    fn numeric_subject_is_stringified() {
        let token = token_with_payload(&json!({"user_id": 42}));
        assert_eq!(subject_id(&token), Ok("42".to_string()));
    }

    #[test]
    fn malformed_tokens_degrade_to_errors() {
        assert_eq!(decode_claims("not-a-token"), Err(DecodeError::Segments(1)));
        assert_eq!(decode_claims("a.b.c.d"), Err(DecodeError::Segments(4)));
        assert!(matches!(
            decode_claims("x.!!!!.y"),
            Err(DecodeError::Base64(_))
        ));

        let not_utf8 = format!("x.{}.y", URL_SAFE_NO_PAD.encode([0xff, 0xfe, 0xfd]));
        assert_eq!(decode_claims(&not_utf8), Err(DecodeError::Utf8));

        let array = format!("x.{}.y", URL_SAFE_NO_PAD.encode("[1,2]"));
        assert!(matches!(decode_claims(&array), Err(DecodeError::Json(_))));
    }

    #[test]
    fn missing_subject_is_reported() {
        let token = token_with_payload(&json!({"sub": "someone"}));
        assert_eq!(
            subject_id(&token),
            Err(DecodeError::MissingClaim(SUBJECT_CLAIM))
        );
    }
}
