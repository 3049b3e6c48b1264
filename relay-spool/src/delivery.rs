use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use relay_client::{ClientCache, Connector, EnvelopeError, EnvelopeStatus, OutboundEnvelope, SmtpClient, WithConnectionOutcome};
use relay_types::{MessageRecord, Queue, Status};
use tracing::{info, warn};

use crate::{
    events::{Event, EventBus},
    scheduler::{schedule, DeliveryOutcome},
    storage::{Entry, Mutation, Storage},
};

/// Deadline applied to `cache.with_connection` for a single delivery
/// attempt, covering both the pool wait and the send itself (§5).
const DEFAULT_GIVE_UP: Duration = Duration::from_secs(60);

/// Deadline applied to the two short, local `with_entry` critical sections
/// (mark `Sending`, then apply the outcome) around a delivery attempt.
const LOCK_GIVE_UP: Duration = Duration::from_secs(5);

/// Drives one pass over the `Active` queue, attempting delivery of every
/// entry whose effective status is `Send_now` (§4.5).
pub struct DeliveryEngine<S: Storage, Cn: Connector> {
    storage: Arc<S>,
    cache: Arc<ClientCache<Cn>>,
    events: Arc<EventBus>,
    give_up: Duration,
}

impl<S, Cn> DeliveryEngine<S, Cn>
where
    S: Storage,
    Cn: Connector,
    Cn::Connection: SmtpClient,
{
    pub fn new(storage: Arc<S>, cache: Arc<ClientCache<Cn>>, events: Arc<EventBus>) -> DeliveryEngine<S, Cn> {
        DeliveryEngine {
            storage,
            cache,
            events,
            give_up: DEFAULT_GIVE_UP,
        }
    }

    /// Overrides the per-attempt deadline passed to `cache.with_connection`
    /// (operator-configurable via the binary's `give_up_secs` knob).
    pub fn with_give_up(mut self, give_up: Duration) -> DeliveryEngine<S, Cn> {
        self.give_up = give_up;
        self
    }

    /// One tick: lists the `Active` queue in spool-date order (oldest
    /// first) and attempts each due entry in turn. Entries that lose the
    /// lock race are skipped and retried on the next tick.
    pub async fn tick(&self) -> Result<(), crate::storage::SpoolError> {
        let mut entries = self.storage.list(Queue::Active).await?;
        entries.sort_by_key(|e| e.spool_date);
        let now = Utc::now();
        for entry in entries {
            self.process_entry(&entry, now).await;
        }
        Ok(())
    }

    /// Runs `tick` forever on `cadence`, so that a wall-clock `Send_at`
    /// coming due gets picked up even without an event-bus wakeup.
    pub async fn run(&self, cadence: Duration) {
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "delivery tick failed");
            }
            smol::Timer::after(cadence).await;
        }
    }

    /// Like `run`, but stops after the current tick once `shutdown` fires
    /// (or its sender is dropped), instead of running forever. A tick that
    /// is already in flight completes before the loop exits — the entry
    /// lock it holds is never abandoned mid-mutation, only the wait for the
    /// next tick is cut short.
    pub async fn run_until(&self, cadence: Duration, shutdown: smol::channel::Receiver<()>) {
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "delivery tick failed");
            }
            let stop = smol::future::or(
                async {
                    smol::Timer::after(cadence).await;
                    false
                },
                async {
                    let _ = shutdown.recv().await;
                    true
                },
            )
            .await;
            if stop {
                info!("delivery loop shutting down");
                return;
            }
        }
    }

    async fn process_entry(&self, entry: &Entry, now: chrono::DateTime<Utc>) {
        let record = match self.start_sending(entry, now).await {
            Some(r) => r,
            None => return,
        };

        self.events.publish(Event::SendingStarted { id: record.id.clone() }).await;

        let body = match self.storage.read_body(entry).await {
            Ok(b) => b,
            Err(e) => {
                warn!(message_id = %record.id, error = %e, "could not read message body");
                return;
            }
        };

        let outcome = self.attempt_delivery(&record, &body).await;
        self.finish_sending(entry, &record, outcome).await;
    }

    /// First lock window: if the entry has no remaining recipients it goes
    /// straight to `Frozen` without ever entering `Sending` (the §8
    /// boundary behavior). Otherwise, if it is due, marks it `Sending` and
    /// returns the in-memory snapshot that was just persisted.
    async fn start_sending(&self, entry: &Entry, now: chrono::DateTime<Utc>) -> Option<MessageRecord> {
        let captured: Arc<std::sync::Mutex<Option<MessageRecord>>> = Arc::new(std::sync::Mutex::new(None));
        let captured_inner = captured.clone();

        let result = self
            .storage
            .with_entry(
                entry,
                None,
                Instant::now() + LOCK_GIVE_UP,
                Box::new(move |record| {
                    if record.remaining_recipients.is_empty() {
                        let mut r = record;
                        r.status = Status::Frozen;
                        return Mutation::Save(r);
                    }
                    if !record.status.is_due(now) {
                        return Mutation::Keep;
                    }
                    let mut r = record;
                    r.status = Status::Sending;
                    *captured_inner.lock().expect("capture mutex poisoned") = Some(r.clone());
                    Mutation::Save(r)
                }),
            )
            .await;

        if let Err(e) = result {
            if !matches!(e, crate::storage::SpoolError::Locked) {
                warn!(error = %e, "failed to start delivery for entry");
            }
            return None;
        }

        captured.lock().expect("capture mutex poisoned").take()
    }

    async fn attempt_delivery(&self, record: &MessageRecord, body: &[u8]) -> DeliveryOutcome {
        let candidates = record.next_hop_choices.clone();
        let give_up_at = Instant::now() + self.give_up;
        let sender = record.envelope_info.sender.clone();
        let sender_args = record.envelope_info.sender_args.clone();
        let recipients = record.remaining_recipients.clone();

        let outcome = self
            .cache
            .with_connection(&candidates, give_up_at, move |conn| async move {
                let envelope = OutboundEnvelope {
                    sender: sender.as_ref(),
                    sender_args: &sender_args,
                    recipients: &recipients,
                    body,
                };
                conn.send_envelope(&envelope).await
            })
            .await;

        match outcome {
            WithConnectionOutcome::Ok(_addr, status) => match status {
                EnvelopeStatus::Ok { rejected_recipients, .. } => DeliveryOutcome::Delivered(rejected_recipients),
                EnvelopeStatus::Error(EnvelopeError::NoRecipients(r)) => DeliveryOutcome::NoRecipients(r),
                EnvelopeStatus::Error(EnvelopeError::RejectedSender(r)) => DeliveryOutcome::RejectedSender(r),
                EnvelopeStatus::Error(EnvelopeError::RejectedSenderAndRecipients(r, v)) => {
                    DeliveryOutcome::RejectedSenderAndRecipients(r, v)
                }
                EnvelopeStatus::Error(EnvelopeError::RejectedBody(r, v)) => DeliveryOutcome::RejectedBody(r, v),
            },
            WithConnectionOutcome::ErrorOpeningResource(e) => DeliveryOutcome::ConnectionError(e),
            WithConnectionOutcome::GaveUpWaiting => DeliveryOutcome::GaveUpWaiting,
            WithConnectionOutcome::CacheClosed => DeliveryOutcome::CacheClosed,
        }
    }

    /// Second lock window: translates the outcome via the retry scheduler
    /// and persists it. Refuses to clobber the record if an operator moved
    /// it out of `Sending` in the meantime (e.g. a concurrent `freeze`).
    async fn finish_sending(&self, entry: &Entry, record: &MessageRecord, outcome: DeliveryOutcome) {
        let result = schedule(record, outcome, Utc::now());
        let new_status = result.status.clone();

        let save_result = self
            .storage
            .with_entry(
                entry,
                None,
                Instant::now() + LOCK_GIVE_UP,
                {
                    let result = result.clone();
                    Box::new(move |on_disk| {
                        if on_disk.status != Status::Sending {
                            return Mutation::Keep;
                        }
                        let mut r = on_disk;
                        r.status = result.status;
                        r.remaining_recipients = result.remaining_recipients;
                        r.failed_recipients = result.failed_recipients;
                        r.retry_intervals = result.retry_intervals;
                        if let Some(attempt) = result.attempt {
                            r.relay_attempts.insert(0, attempt);
                        }
                        match r.status {
                            Status::Delivered => Mutation::Remove,
                            _ => Mutation::Save(r),
                        }
                    })
                },
            )
            .await;

        if let Err(e) = save_result {
            warn!(message_id = %record.id, error = %e, "failed to persist delivery outcome");
            return;
        }

        match new_status {
            Status::Delivered => {
                info!(message_id = %record.id, "delivered");
                self.events
                    .publish(Event::Delivered {
                        id: record.id.clone(),
                        failed_recipients: result.failed_recipients.clone(),
                    })
                    .await;
            }
            Status::Frozen => {
                self.events.publish(Event::Frozen { id: record.id.clone() }).await;
            }
            _ => {
                self.events
                    .publish(Event::RecipientsUpdated {
                        id: record.id.clone(),
                        remaining: result.remaining_recipients.clone(),
                        failed: result.failed_recipients.clone(),
                    })
                    .await;
            }
        }

        if let Some(attempt) = result.attempt {
            self.events
                .publish(Event::SendAttemptFailed {
                    id: record.id.clone(),
                    error: attempt.error,
                })
                .await;
        }
    }
}
