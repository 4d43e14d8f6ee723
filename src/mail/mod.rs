//! Mailbox access for one-time verification codes.
//!
//! The [`Mailbox`] trait is the seam to the mail store; [`MailPoller`] layers
//! message selection, code extraction, and the freshness gate on top of it.

#[cfg(feature = "imap")]
mod imap;
mod parse;
mod poller;

#[cfg(feature = "imap")]
pub use imap::{ImapMailbox, ImapSettings};
pub use parse::{extract_text_body, header_date, CodeExtractor, DEFAULT_CODE_PATTERNS};
pub use poller::{
    Attempt, MailPoller, OtpAttempt, OtpPoll, RetryPolicy, DEFAULT_FRESHNESS,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Which messages count as verification-code mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    /// Sender address to match.
    pub sender: String,
    /// Substring the subject must contain.
    pub subject: String,
}

/// A message returned by a mailbox search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Store-assigned identifier, used to flag the message once consumed.
    pub uid: u32,
    /// When the store received the message.
    pub received_at: DateTime<Utc>,
    /// Decoded plain-text body.
    pub body: String,
    /// Already flagged as read, e.g. consumed by an earlier run.
    pub seen: bool,
}

/// Read access to one mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Return every message matching `rule`, in no particular order.
    async fn search(&self, rule: &MatchRule) -> Result<Vec<MailMessage>>;

    /// Flag a message so it is not picked up again.
    ///
    /// Best-effort: the default does nothing.
    async fn mark_consumed(&self, _uid: u32) -> Result<()> {
        Ok(())
    }
}
