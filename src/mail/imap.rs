//! IMAP-backed [`Mailbox`].
//!
//! Each search opens a fresh TLS session, so a poll never depends on a
//! connection left over from an earlier attempt.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use futures::TryStreamExt;
use async_imap::types::Flag;
use secrecy::{ExposeSecret, SecretString};
use tokio_rustls::rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::parse::{extract_text_body, header_date};
use super::{MailMessage, Mailbox, MatchRule};

type ImapSession = async_imap::Session<Compat<tokio_rustls::client::TlsStream<tokio::net::TcpStream>>>;

/// Connection settings for an IMAP mailbox.
#[derive(Debug)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
    /// How many days back the server-side `SINCE` filter reaches.
    pub lookback_days: u64,
    /// Whether consumed messages are flagged `\Seen`. When set, searches
    /// also skip messages that are already seen.
    pub mark_seen: bool,
}

pub struct ImapMailbox {
    settings: ImapSettings,
}

impl ImapMailbox {
    pub fn new(settings: ImapSettings) -> Self {
        Self { settings }
    }

    async fn connect(&self) -> Result<ImapSession> {
        let host = self.settings.host.as_str();

        let mut root_store = RootCertStore::empty();
        let native_certs =
            rustls_native_certs::load_native_certs().context("Failed to load native certs")?;
        for cert in native_certs {
            let _ = root_store.add(&Certificate(cert.as_ref().to_vec()));
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(host)
            .with_context(|| format!("Invalid IMAP hostname: {host}"))?;

        let tcp = tokio::net::TcpStream::connect((host, self.settings.port))
            .await
            .with_context(|| format!("IMAP connect to {host}:{} failed", self.settings.port))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .context("IMAP TLS handshake failed")?;

        let client = async_imap::Client::new(tls.compat());
        let mut session = client
            .login(&self.settings.username, self.settings.password.expose_secret())
            .await
            .map_err(|e| anyhow::anyhow!("IMAP login failed: {}", e.0))?;

        session
            .select(&self.settings.folder)
            .await
            .with_context(|| format!("Failed to select folder {:?}", self.settings.folder))?;

        Ok(session)
    }

    fn since(&self) -> NaiveDate {
        let today = Utc::now().date_naive();
        today
            .checked_sub_days(Days::new(self.settings.lookback_days))
            .unwrap_or(today)
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn search(&self, rule: &MatchRule) -> Result<Vec<MailMessage>> {
        let mut session = self.connect().await?;
        let query = search_query(rule, self.since(), self.settings.mark_seen);

        let uids = session
            .uid_search(&query)
            .await
            .with_context(|| format!("IMAP search failed: {query}"))?;
        tracing::debug!(matches = uids.len(), %query, "Searched mailbox");

        let mut messages = Vec::new();
        if !uids.is_empty() {
            let uid_set = uids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let fetched: Vec<_> = session
                .uid_fetch(&uid_set, "(UID FLAGS INTERNALDATE BODY.PEEK[])")
                .await
                .context("IMAP fetch failed")?
                .try_collect()
                .await
                .context("IMAP fetch stream failed")?;

            for fetch in &fetched {
                let (Some(uid), Some(raw)) = (fetch.uid, fetch.body()) else {
                    continue;
                };
                let raw = String::from_utf8_lossy(raw);
                let received_at = fetch
                    .internal_date()
                    .map(|d| d.with_timezone(&Utc))
                    .or_else(|| header_date(&raw));
                let Some(received_at) = received_at else {
                    tracing::warn!(uid, "Skipping message without a usable date");
                    continue;
                };
                let seen = fetch.flags().any(|flag| matches!(flag, Flag::Seen));
                messages.push(MailMessage {
                    uid,
                    received_at,
                    body: extract_text_body(&raw),
                    seen,
                });
            }
        }

        let _ = session.logout().await;
        Ok(messages)
    }

    async fn mark_consumed(&self, uid: u32) -> Result<()> {
        if !self.settings.mark_seen {
            return Ok(());
        }
        let mut session = self.connect().await?;
        let _updates: Vec<_> = session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .await
            .context("IMAP store failed")?
            .try_collect()
            .await
            .context("IMAP store stream failed")?;
        let _ = session.logout().await;
        Ok(())
    }
}

/// Build the server-side search for verification mail.
fn search_query(rule: &MatchRule, since: NaiveDate, unseen_only: bool) -> String {
    let mut query = format!(
        "FROM {} SUBJECT {} SINCE {}",
        quote(&rule.sender),
        quote(&rule.subject),
        since.format("%d-%b-%Y")
    );
    if unseen_only {
        query.push_str(" UNSEEN");
    }
    query
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
