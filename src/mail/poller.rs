use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};

use super::{CodeExtractor, MailMessage, Mailbox, MatchRule};

/// Maximum age of a verification code that may still be submitted.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(2 * 60);

/// Documented bound on mailbox polls per run.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Fixed delay between mailbox polls.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One mailbox poll that produced a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpAttempt {
    pub uid: u32,
    pub fetched_at: DateTime<Utc>,
    pub email_timestamp: DateTime<Utc>,
    pub code: String,
}

impl OtpAttempt {
    /// Age of the message at fetch time. Clock skew never makes it negative.
    pub fn age(&self) -> Duration {
        (self.fetched_at - self.email_timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn age_minutes(&self) -> f64 {
        self.age().as_secs_f64() / 60.0
    }

    pub fn is_fresh(&self, freshness: Duration) -> bool {
        self.age() <= freshness
    }
}

/// Outcome of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpPoll {
    /// A code young enough to submit.
    Fresh(OtpAttempt),
    /// The newest matching message is too old; its code must not be used.
    Stale(OtpAttempt),
    /// Nothing usable: no matching message, or no code in the newest one.
    Absent { reason: String },
}

impl OtpPoll {
    pub fn describe(&self) -> String {
        match self {
            OtpPoll::Fresh(a) => format!("fresh code ({}s old)", a.age().as_secs()),
            OtpPoll::Stale(a) => format!("stale code ({:.1} minutes old)", a.age_minutes()),
            OtpPoll::Absent { reason } => reason.clone(),
        }
    }
}

/// Fixed-delay, fixed-count retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Position within a [`RetryPolicy`] schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub of: u32,
}

impl Attempt {
    pub fn is_last(&self) -> bool {
        self.number >= self.of
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Iterate over attempt numbers `1..=max_attempts`.
    pub fn attempts(&self) -> impl Iterator<Item = Attempt> {
        let of = self.max_attempts;
        (1..=of).map(move |number| Attempt { number, of })
    }

    /// Worst-case time spent waiting between attempts.
    pub fn total_delay(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

/// Finds the newest verification code in a mailbox and gates it on freshness.
pub struct MailPoller<M> {
    mailbox: M,
    rule: MatchRule,
    extractor: CodeExtractor,
    freshness: Duration,
    clock: Arc<dyn Clock>,
}

impl<M: Mailbox> MailPoller<M> {
    pub fn new(mailbox: M, rule: MatchRule) -> Self {
        Self {
            mailbox,
            rule,
            extractor: CodeExtractor::default(),
            freshness: DEFAULT_FRESHNESS,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_extractor(mut self, extractor: CodeExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    pub fn mailbox(&self) -> &M {
        &self.mailbox
    }

    /// Poll the mailbox once.
    ///
    /// Only the unseen message with the latest receive time is considered;
    /// older matches are never used even if the newest one has no code.
    /// Messages already consumed by an earlier run are skipped.
    pub async fn poll(&self) -> Result<OtpPoll> {
        let messages = self.mailbox.search(&self.rule).await?;
        let Some(latest) = newest(&messages) else {
            return Ok(OtpPoll::Absent {
                reason: format!(
                    "no unseen message from {} with subject containing {:?}",
                    self.rule.sender, self.rule.subject
                ),
            });
        };

        let Some(code) = self.extractor.extract(&latest.body) else {
            tracing::debug!(uid = latest.uid, "Newest verification message has no code");
            return Ok(OtpPoll::Absent {
                reason: format!("message {} contains no verification code", latest.uid),
            });
        };

        let attempt = OtpAttempt {
            uid: latest.uid,
            fetched_at: self.clock.now(),
            email_timestamp: latest.received_at,
            code,
        };

        if attempt.is_fresh(self.freshness) {
            Ok(OtpPoll::Fresh(attempt))
        } else {
            tracing::info!(
                uid = attempt.uid,
                age_secs = attempt.age().as_secs(),
                freshness_secs = self.freshness.as_secs(),
                "Discarding stale verification code"
            );
            Ok(OtpPoll::Stale(attempt))
        }
    }

    /// Flag a used message, logging instead of failing.
    pub async fn consume(&self, attempt: &OtpAttempt) {
        if let Err(e) = self.mailbox.mark_consumed(attempt.uid).await {
            tracing::warn!(uid = attempt.uid, error = %e, "Failed to flag verification message");
        }
    }
}

fn newest(messages: &[MailMessage]) -> Option<&MailMessage> {
    messages
        .iter()
        .filter(|m| !m.seen)
        .max_by(|a, b| a.received_at.cmp(&b.received_at).then(a.uid.cmp(&b.uid)))
}
