use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    address::{Address, EmailAddress, ReplyCode},
    id::{EnvelopeId, MessageId},
    status::{Queue, Status},
};

/// Opaque causal identifier correlating a server session, envelope ingress
/// and the delivery attempts descending from it across log events.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Deserialize, serde::Serialize)]
pub struct FlowId(Arc<str>);

impl FlowId {
    pub fn new(raw: impl Into<Arc<str>>) -> FlowId {
        FlowId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable set of [`FlowId`]s, carried by value. `with`/`union` return a
/// new set rather than mutating in place, per this design's preference for
/// flows as pure data rather than a mutable logging context.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Flows(BTreeSet<FlowId>);

impl Flows {
    pub fn new() -> Flows {
        Flows(BTreeSet::new())
    }

    pub fn single(id: FlowId) -> Flows {
        let mut s = BTreeSet::new();
        s.insert(id);
        Flows(s)
    }

    #[must_use]
    pub fn with(&self, id: FlowId) -> Flows {
        let mut s = self.0.clone();
        s.insert(id);
        Flows(s)
    }

    #[must_use]
    pub fn union(&self, other: &Flows) -> Flows {
        Flows(self.0.union(&other.0).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowId> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The SMTP envelope as accepted by the (out-of-scope) front-end: sender,
/// any `MAIL FROM` parameters, the recipients assigned to this message, and
/// any recipients the front-end itself already rejected before handing the
/// envelope to the spool.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnvelopeInfo {
    pub sender: Option<EmailAddress>,
    pub sender_args: Vec<String>,
    pub recipients: Vec<EmailAddress>,
    pub rejected_recipients: Vec<(EmailAddress, ReplyCode)>,
}

impl EnvelopeInfo {
    pub fn new(sender: Option<EmailAddress>, recipients: Vec<EmailAddress>) -> EnvelopeInfo {
        EnvelopeInfo {
            sender,
            sender_args: Vec::new(),
            recipients,
            rejected_recipients: Vec::new(),
        }
    }
}

/// Why a single relay attempt failed, recorded newest-first in
/// [`MessageRecord::relay_attempts`] and also broadcast as a
/// `SendAttemptFailed` event.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error, serde::Deserialize, serde::Serialize)]
pub enum RelayError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("gave up waiting for a free connection")]
    GaveUpWaiting,
    #[error("connection cache is closed")]
    CacheClosed,
    #[error("rejected: {0}")]
    Rejected(ReplyCode),
    #[error("no recipients were accepted")]
    NoRecipients,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RelayAttempt {
    pub at: DateTime<Utc>,
    pub error: RelayError,
}

/// A retry schedule: a FIFO list of wait durations. The head is the wait to
/// apply after the *next* failed attempt; each failure pops it.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RetryIntervals(Vec<i64>);

impl RetryIntervals {
    pub fn new(intervals: impl IntoIterator<Item = std::time::Duration>) -> RetryIntervals {
        RetryIntervals(intervals.into_iter().map(|d| d.as_secs() as i64).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pop the head interval, if any, returning it alongside the remaining
    /// schedule.
    pub fn pop_front(&self) -> Option<(std::time::Duration, RetryIntervals)> {
        let (head, rest) = self.0.split_first()?;
        Some((
            std::time::Duration::from_secs((*head).max(0) as u64),
            RetryIntervals(rest.to_vec()),
        ))
    }

    /// Prepend extra intervals onto the front of the schedule (used by the
    /// `send` control operation).
    #[must_use]
    pub fn prepend(&self, extra: impl IntoIterator<Item = std::time::Duration>) -> RetryIntervals {
        let mut v: Vec<i64> = extra.into_iter().map(|d| d.as_secs() as i64).collect();
        v.extend_from_slice(&self.0);
        RetryIntervals(v)
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }
}

/// The full per-message spool record (§3). Mutation only ever happens while
/// holding the entry's exclusive lock (see `relay-spool`'s `Storage` trait);
/// this type itself is plain data.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub parent_envelope_id: EnvelopeId,
    /// Human-readable label for the directory the message was originally
    /// spooled under; informational only, the authoritative queue is always
    /// derived from `status` (invariant 1).
    pub spool_dir: String,
    pub spool_date: DateTime<Utc>,
    pub next_hop_choices: Vec<Address>,
    pub retry_intervals: RetryIntervals,
    pub remaining_recipients: Vec<EmailAddress>,
    pub failed_recipients: Vec<EmailAddress>,
    /// Newest attempt first.
    pub relay_attempts: Vec<RelayAttempt>,
    pub status: Status,
    pub flows: Flows,
    pub envelope_info: EnvelopeInfo,
}

/// Failure of [`MessageRecord::check_invariants`]: the record violates one of
/// the invariants listed in §3 of the design. Surfaced to operators exactly
/// like a `DiskDivergence`, since both indicate state corruption.
#[derive(Debug, thiserror::Error)]
pub enum InvariantViolation {
    #[error("recipient {0} is in both remaining_recipients and failed_recipients")]
    RecipientInBothSets(EmailAddress),
    #[error("recipient {0} from envelope_info.recipients is accounted for nowhere")]
    RecipientUnaccountedFor(EmailAddress),
}

impl MessageRecord {
    pub fn new(
        id: MessageId,
        parent_envelope_id: EnvelopeId,
        spool_dir: impl Into<String>,
        next_hop_choices: Vec<Address>,
        retry_intervals: RetryIntervals,
        envelope_info: EnvelopeInfo,
        flows: Flows,
        now: DateTime<Utc>,
    ) -> MessageRecord {
        let remaining_recipients = envelope_info.recipients.clone();
        MessageRecord {
            id,
            parent_envelope_id,
            spool_dir: spool_dir.into(),
            spool_date: now,
            next_hop_choices,
            retry_intervals,
            remaining_recipients,
            failed_recipients: Vec::new(),
            relay_attempts: Vec::new(),
            status: Status::SendNow,
            flows,
            envelope_info,
        }
    }

    pub fn queue(&self) -> Option<Queue> {
        self.status.queue()
    }

    /// Checks invariants 2 and 3 from §3. Invariant 1 (directory matches
    /// queue) and invariant 4 (sibling files) are properties of the storage
    /// layer and checked there instead.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for r in &self.remaining_recipients {
            if self.failed_recipients.contains(r) {
                return Err(InvariantViolation::RecipientInBothSets(r.clone()));
            }
        }
        // Once delivered, the record is gone; we can only check accounting
        // while the record still exists (remaining ∪ failed must cover all
        // known recipients).
        if !matches!(self.status, Status::Delivered) {
            for r in &self.envelope_info.recipients {
                if !self.remaining_recipients.contains(r) && !self.failed_recipients.contains(r) {
                    return Err(InvariantViolation::RecipientUnaccountedFor(r.clone()));
                }
            }
        }
        Ok(())
    }
}
