use std::time::Instant;

use relay_types::{EnvelopeInfo, MessageId, MessageRecord, RetryIntervals, Status};

use crate::{
    events::{Event, EventBus},
    storage::{Entry, Mutation, SpoolError, Storage},
};

/// Mutating helpers over a single entry (§4.2). Each is a thin `with_entry`
/// wrapper: it holds the entry lock only for the duration of the pure
/// decision, never across I/O. `expected` is the caller's in-memory copy of
/// the record (e.g. what `ControlSurface` read just before deciding to act);
/// `with_entry` fails with `DiskDivergence` rather than applying the
/// mutation if the on-disk record no longer matches it (§4.2).

/// Writes a freshly reserved id's record and body, then publishes `Spooled`.
/// The entry point a front-end spools an accepted envelope through, so that
/// publishing the lifecycle event can never be forgotten at a call site.
pub async fn enqueue<S: Storage>(
    storage: &S,
    events: &EventBus,
    id: MessageId,
    record: &MessageRecord,
    body: &[u8],
) -> Result<(), SpoolError> {
    storage.enqueue(id.clone(), record, body).await?;
    events.publish(Event::Spooled { id }).await;
    Ok(())
}

pub async fn freeze<S: Storage>(storage: &S, entry: &Entry, expected: &MessageRecord, give_up: Instant) -> Result<(), SpoolError> {
    storage
        .with_entry(
            entry,
            Some(expected),
            give_up,
            Box::new(|record| {
                if record.status == Status::Frozen {
                    return Mutation::Keep;
                }
                let mut r = record;
                r.status = Status::Frozen;
                Mutation::Save(r)
            }),
        )
        .await
}

/// Prepends `extra_intervals` onto the record's retry schedule and marks it
/// eligible for immediate delivery (the `send` control operation).
pub async fn mark_for_send_now<S: Storage>(
    storage: &S,
    entry: &Entry,
    expected: &MessageRecord,
    extra_intervals: RetryIntervals,
    give_up: Instant,
) -> Result<(), SpoolError> {
    storage
        .with_entry(
            entry,
            Some(expected),
            give_up,
            Box::new(move |record| {
                let extra_secs = extra_intervals.as_slice().to_vec();
                let mut r = record;
                r.retry_intervals = r
                    .retry_intervals
                    .prepend(extra_secs.into_iter().map(|s| std::time::Duration::from_secs(s.max(0) as u64)));
                r.status = Status::SendNow;
                Mutation::Save(r)
            }),
        )
        .await
}

pub async fn remove<S: Storage>(storage: &S, entry: &Entry, expected: &MessageRecord, give_up: Instant) -> Result<(), SpoolError> {
    storage
        .with_entry(
            entry,
            Some(expected),
            give_up,
            Box::new(|record| {
                if record.status == Status::Removed {
                    return Mutation::Keep;
                }
                let mut r = record;
                r.status = Status::Removed;
                Mutation::Save(r)
            }),
        )
        .await
}

/// Moves a `Removed` or `Quarantined` entry back to `Frozen` so an operator
/// can inspect it before re-sending.
pub async fn recover_entry<S: Storage>(storage: &S, entry: &Entry, expected: &MessageRecord, give_up: Instant) -> Result<(), SpoolError> {
    storage
        .with_entry(
            entry,
            Some(expected),
            give_up,
            Box::new(|record| match record.status {
                Status::Removed | Status::Quarantined(_) => {
                    let mut r = record;
                    r.status = Status::Frozen;
                    Mutation::Save(r)
                }
                _ => Mutation::Keep,
            }),
        )
        .await
}

/// Applies `f` to the record's envelope info (e.g. correcting a recipient
/// list before the next attempt). Generic over the mutation so the core
/// doesn't need to anticipate every reason an operator or front-end might
/// want to touch an envelope.
pub async fn map_email<S, F>(storage: &S, entry: &Entry, expected: &MessageRecord, give_up: Instant, f: F) -> Result<(), SpoolError>
where
    S: Storage,
    F: FnOnce(EnvelopeInfo) -> EnvelopeInfo + Send + 'static,
{
    storage
        .with_entry(
            entry,
            Some(expected),
            give_up,
            Box::new(move |record| {
                let mut r = record;
                r.envelope_info = f(r.envelope_info);
                Mutation::Save(r)
            }),
        )
        .await
}
