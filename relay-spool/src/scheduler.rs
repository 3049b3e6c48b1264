use chrono::{DateTime, Utc};

use relay_client::ConnectError;
use relay_types::{EmailAddress, MessageRecord, RelayAttempt, RelayError, ReplyCode, RetryIntervals, Status};

/// The result of one delivery attempt, already translated from
/// `relay_client`'s connection-cache and envelope-status outcomes into the
/// shape the scheduler needs to reason about.
#[derive(Clone, Debug)]
pub enum DeliveryOutcome {
    Delivered(Vec<(EmailAddress, ReplyCode)>),
    NoRecipients(Vec<(EmailAddress, ReplyCode)>),
    RejectedSender(ReplyCode),
    RejectedSenderAndRecipients(ReplyCode, Vec<(EmailAddress, ReplyCode)>),
    RejectedBody(ReplyCode, Vec<(EmailAddress, ReplyCode)>),
    GaveUpWaiting,
    CacheClosed,
    ConnectionError(ConnectError),
}

/// What [`schedule`] decided the record's next state should be, plus the
/// updated recipient bookkeeping and, if this attempt failed, the
/// [`RelayAttempt`] to prepend to `relay_attempts`.
#[derive(Clone, Debug)]
pub struct ScheduleResult {
    pub status: Status,
    pub remaining_recipients: Vec<EmailAddress>,
    pub failed_recipients: Vec<EmailAddress>,
    pub retry_intervals: RetryIntervals,
    pub attempt: Option<RelayAttempt>,
}

fn partition_rejected(remaining: &mut Vec<EmailAddress>, failed: &mut Vec<EmailAddress>, rejected: &[(EmailAddress, ReplyCode)]) {
    for (addr, code) in rejected {
        if code.is_permanent() {
            remaining.retain(|r| r != addr);
            if !failed.contains(addr) {
                failed.push(addr.clone());
            }
        }
    }
}

fn temporary_failure(
    record: &MessageRecord,
    now: DateTime<Utc>,
    remaining: Vec<EmailAddress>,
    failed: Vec<EmailAddress>,
    attempt: RelayAttempt,
) -> ScheduleResult {
    if remaining.is_empty() {
        return ScheduleResult {
            status: Status::Frozen,
            remaining_recipients: remaining,
            failed_recipients: failed,
            retry_intervals: record.retry_intervals.clone(),
            attempt: Some(attempt),
        };
    }
    match record.retry_intervals.pop_front() {
        None => ScheduleResult {
            status: Status::Frozen,
            remaining_recipients: remaining,
            failed_recipients: failed,
            retry_intervals: RetryIntervals::default(),
            attempt: Some(attempt),
        },
        Some((wait, rest)) => ScheduleResult {
            status: Status::SendAt(now + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero())),
            remaining_recipients: remaining,
            failed_recipients: failed,
            retry_intervals: rest,
            attempt: Some(attempt),
        },
    }
}

fn permanent_failure(
    record: &MessageRecord,
    remaining: Vec<EmailAddress>,
    failed: Vec<EmailAddress>,
    attempt: RelayAttempt,
) -> ScheduleResult {
    ScheduleResult {
        status: Status::Frozen,
        remaining_recipients: remaining,
        failed_recipients: failed,
        retry_intervals: record.retry_intervals.clone(),
        attempt: Some(attempt),
    }
}

/// Maps a delivery outcome plus the record's current retry schedule to its
/// next state (§4.3). Pure: no I/O, no side effects, safe to unit-test
/// exhaustively.
pub fn schedule(record: &MessageRecord, outcome: DeliveryOutcome, now: DateTime<Utc>) -> ScheduleResult {
    let mut remaining = record.remaining_recipients.clone();
    let mut failed = record.failed_recipients.clone();

    match outcome {
        DeliveryOutcome::Delivered(rejected) => {
            partition_rejected(&mut remaining, &mut failed, &rejected);
            remaining.clear();
            ScheduleResult {
                status: Status::Delivered,
                remaining_recipients: remaining,
                failed_recipients: failed,
                retry_intervals: record.retry_intervals.clone(),
                attempt: None,
            }
        }
        DeliveryOutcome::NoRecipients(rejected) => {
            partition_rejected(&mut remaining, &mut failed, &rejected);
            let attempt = RelayAttempt {
                at: now,
                error: RelayError::NoRecipients,
            };
            if remaining.is_empty() {
                permanent_failure(record, remaining, failed, attempt)
            } else {
                temporary_failure(record, now, remaining, failed, attempt)
            }
        }
        DeliveryOutcome::RejectedSender(reply) => {
            let permanent = reply.is_permanent();
            let attempt = RelayAttempt {
                at: now,
                error: RelayError::Rejected(reply),
            };
            if permanent {
                permanent_failure(record, remaining, failed, attempt)
            } else {
                temporary_failure(record, now, remaining, failed, attempt)
            }
        }
        DeliveryOutcome::RejectedSenderAndRecipients(reply, rejected) => {
            partition_rejected(&mut remaining, &mut failed, &rejected);
            let permanent = reply.is_permanent();
            let attempt = RelayAttempt {
                at: now,
                error: RelayError::Rejected(reply),
            };
            if permanent || remaining.is_empty() {
                permanent_failure(record, remaining, failed, attempt)
            } else {
                temporary_failure(record, now, remaining, failed, attempt)
            }
        }
        DeliveryOutcome::RejectedBody(reply, rejected) => {
            partition_rejected(&mut remaining, &mut failed, &rejected);
            let permanent = reply.is_permanent();
            let attempt = RelayAttempt {
                at: now,
                error: RelayError::Rejected(reply),
            };
            if permanent || remaining.is_empty() {
                permanent_failure(record, remaining, failed, attempt)
            } else {
                temporary_failure(record, now, remaining, failed, attempt)
            }
        }
        DeliveryOutcome::GaveUpWaiting => {
            let attempt = RelayAttempt {
                at: now,
                error: RelayError::GaveUpWaiting,
            };
            temporary_failure(record, now, remaining, failed, attempt)
        }
        DeliveryOutcome::CacheClosed => {
            let attempt = RelayAttempt {
                at: now,
                error: RelayError::CacheClosed,
            };
            temporary_failure(record, now, remaining, failed, attempt)
        }
        DeliveryOutcome::ConnectionError(e) => {
            let attempt = RelayAttempt {
                at: now,
                error: RelayError::Connection(e.to_string()),
            };
            temporary_failure(record, now, remaining, failed, attempt)
        }
    }
}
