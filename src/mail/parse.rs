//! MIME body extraction and verification-code matching.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;

/// Code patterns tried in order. The first capture group is the code.
///
/// The first entries are anchored to the target's phrasing; the last one
/// accepts any six digits that follow the word "code" in the same sentence.
pub const DEFAULT_CODE_PATTERNS: [&str; 3] = [
    r"(?i)login security code:\s*(\d{6})\b",
    r"(?i)security code:\s*(\d{6})\b",
    r"(?i)\bcode\b[^\d.]{0,80}?\b(\d{6})\b",
];

/// Pulls a numeric verification code out of a message body.
#[derive(Debug, Clone)]
pub struct CodeExtractor {
    patterns: Vec<Regex>,
}

impl Default for CodeExtractor {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_CODE_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }
}

impl CodeExtractor {
    /// Compile a custom ordered pattern list.
    ///
    /// Every pattern must have at least one capture group.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex = Regex::new(pattern)
                .with_context(|| format!("Invalid code pattern: {pattern}"))?;
            if regex.captures_len() < 2 {
                anyhow::bail!("Code pattern has no capture group: {pattern}");
            }
            compiled.push(regex);
        }
        if compiled.is_empty() {
            anyhow::bail!("At least one code pattern is required");
        }
        Ok(Self { patterns: compiled })
    }

    pub fn extract(&self, body: &str) -> Option<String> {
        self.patterns.iter().find_map(|regex| {
            regex
                .captures(body)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .filter(|code| code.chars().all(|c| c.is_ascii_digit()))
        })
    }
}

/// Extract readable text from a raw RFC 822 message.
///
/// Prefers the first `text/plain` part; falls back to HTML with tags removed,
/// then to the raw body after the headers.
pub fn extract_text_body(raw: &str) -> String {
    let (headers, body) = split_headers_body(raw);
    extract_part(&headers, &body).unwrap_or_else(|| body.trim().to_string())
}

/// Parse the `Date:` header of a raw message.
pub fn header_date(raw: &str) -> Option<DateTime<Utc>> {
    let (headers, _) = split_headers_body(raw);
    let value = header_value(&headers, "Date")?;
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn extract_part(headers: &str, body: &str) -> Option<String> {
    let content_type = header_value(headers, "Content-Type")
        .unwrap_or_default()
        .to_lowercase();
    let encoding = header_value(headers, "Content-Transfer-Encoding").unwrap_or_default();

    if content_type.starts_with("multipart/") {
        let raw_type = header_value(headers, "Content-Type").unwrap_or_default();
        let boundary = content_type_param(&raw_type, "boundary")?;
        let parts = split_multipart(body, &boundary);

        let mut html_fallback = None;
        for (part_headers, part_body) in parts {
            let part_type = header_value(&part_headers, "Content-Type")
                .unwrap_or_else(|| "text/plain".to_string())
                .to_lowercase();
            if part_type.starts_with("multipart/") || part_type.starts_with("text/plain") {
                if let Some(text) = extract_part(&part_headers, &part_body) {
                    if part_type.starts_with("text/plain") {
                        return Some(text);
                    }
                    html_fallback.get_or_insert(text);
                }
            } else if part_type.starts_with("text/html") && html_fallback.is_none() {
                html_fallback = extract_part(&part_headers, &part_body);
            }
        }
        return html_fallback;
    }

    let decoded = decode_transfer(body.trim(), &encoding);
    let text = String::from_utf8_lossy(&decoded).to_string();
    if content_type.starts_with("text/html") {
        Some(strip_html(&text))
    } else {
        Some(text.trim().to_string())
    }
}

fn split_headers_body(raw: &str) -> (String, String) {
    if let Some(idx) = raw.find("\r\n\r\n") {
        (raw[..idx].to_string(), raw[idx + 4..].to_string())
    } else if let Some(idx) = raw.find("\n\n") {
        (raw[..idx].to_string(), raw[idx + 2..].to_string())
    } else {
        (String::new(), raw.to_string())
    }
}

/// Case-insensitive header lookup that unfolds continuation lines.
fn header_value(headers: &str, name: &str) -> Option<String> {
    let prefix = format!("{name}:");
    let mut lines = headers.lines().peekable();
    while let Some(line) = lines.next() {
        let matches = line
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(&prefix));
        if matches {
            let mut value = line[prefix.len()..].trim().to_string();
            while let Some(next) = lines.peek() {
                if next.starts_with(' ') || next.starts_with('\t') {
                    value.push(' ');
                    value.push_str(next.trim());
                    lines.next();
                } else {
                    break;
                }
            }
            return Some(value);
        }
    }
    None
}

/// Byte offsets found in the lowered copy must index the original, so only
/// ASCII case folding is allowed here.
fn content_type_param(header: &str, param: &str) -> Option<String> {
    let needle = format!("{param}=");
    let lower = header.to_ascii_lowercase();
    let idx = lower.find(&needle)?;
    let rest = header[idx + needle.len()..].trim_start();
    let value = if let Some(quoted) = rest.strip_prefix('"') {
        quoted.split('"').next().unwrap_or_default()
    } else {
        rest.split(|c: char| c == ';' || c.is_whitespace())
            .next()
            .unwrap_or_default()
    };
    (!value.is_empty()).then(|| value.to_string())
}

fn split_multipart(body: &str, boundary: &str) -> Vec<(String, String)> {
    let delimiter = format!("--{boundary}");
    body.split(&delimiter)
        .skip(1)
        .filter(|part| !part.starts_with("--"))
        .map(|part| {
            let part = part.trim_start_matches(['\r', '\n']);
            split_headers_body(part)
        })
        .collect()
}

fn decode_transfer(body: &str, encoding: &str) -> Vec<u8> {
    match encoding.trim().to_lowercase().as_str() {
        "base64" => {
            let cleaned: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(cleaned)
                .unwrap_or_else(|_| body.as_bytes().to_vec())
        }
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.as_bytes().to_vec(),
    }
}

fn decode_quoted_printable(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        // Soft line break.
        if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
            i += 3;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }
        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match hex {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
