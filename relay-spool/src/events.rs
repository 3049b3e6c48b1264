use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use relay_types::{EmailAddress, MessageId, RelayError, ReplyCode};
use smol::lock::Mutex;

/// Heartbeat cadence (§4.6): lets subscribers tell a dead connection apart
/// from a quiet one.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Per-message-id lifecycle events broadcast by the spool. Events for a
/// single id are totally ordered for every subscriber that keeps up (§5);
/// this holds because every publisher path serializes its events behind the
/// entry's exclusive lock before calling [`EventBus::publish`].
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub enum Event {
    Spooled { id: MessageId },
    SendingStarted { id: MessageId },
    SendAttemptFailed { id: MessageId, error: RelayError },
    RecipientsUpdated { id: MessageId, remaining: Vec<EmailAddress>, failed: Vec<EmailAddress> },
    Delivered { id: MessageId, failed_recipients: Vec<EmailAddress> },
    Frozen { id: MessageId },
    Removed { id: MessageId },
    /// A subscriber missed `n` events because its queue was full; emitted in
    /// their place instead of blocking the publisher.
    Dropped(u64),
    Heartbeat,
}

struct Subscriber {
    sender: smol::channel::Sender<Event>,
    dropped: AtomicU64,
}

struct Inner {
    subscribers: Vec<Subscriber>,
}

/// Multi-producer, multi-subscriber broadcast of [`Event`]s (§4.6).
///
/// Each subscription gets its own bounded channel; a publish that would
/// block on a full channel instead counts the event as dropped for that
/// subscriber and moves on, never blocking the producer. Once the
/// subscriber catches up, the drop count is flushed as a single
/// `Dropped(n)` event ahead of the next real one.
pub struct EventBus {
    inner: Mutex<Inner>,
    capacity: usize,
}

/// A subscription handle: an async stream of events via `recv()`.
pub struct Subscription {
    receiver: smol::channel::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&self) -> Option<Event> {
        self.receiver.recv().await.ok()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> EventBus {
        EventBus {
            inner: Mutex::new(Inner { subscribers: Vec::new() }),
            capacity,
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = smol::channel::bounded(self.capacity);
        let mut inner = self.inner.lock().await;
        inner.subscribers.push(Subscriber {
            sender: tx,
            dropped: AtomicU64::new(0),
        });
        Subscription { receiver: rx }
    }

    pub async fn publish(&self, event: Event) {
        let inner = self.inner.lock().await;
        for sub in &inner.subscribers {
            let pending = sub.dropped.load(Ordering::Relaxed);
            if pending > 0 {
                if sub.sender.try_send(Event::Dropped(pending)).is_ok() {
                    sub.dropped.store(0, Ordering::Relaxed);
                } else {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            if sub.sender.try_send(event.clone()).is_err() {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Runs forever, publishing a `Heartbeat` every [`HEARTBEAT_INTERVAL`].
    /// Callers spawn this alongside the delivery loop's tick task.
    pub async fn run_heartbeat(&self) {
        loop {
            smol::Timer::after(HEARTBEAT_INTERVAL).await;
            self.publish(Event::Heartbeat).await;
        }
    }

    /// Like `run_heartbeat`, but returns once `shutdown` fires (or its
    /// sender is dropped) instead of running forever.
    pub async fn run_heartbeat_until(&self, shutdown: smol::channel::Receiver<()>) {
        loop {
            let stop = smol::future::or(
                async {
                    smol::Timer::after(HEARTBEAT_INTERVAL).await;
                    false
                },
                async {
                    let _ = shutdown.recv().await;
                    true
                },
            )
            .await;
            if stop {
                return;
            }
            self.publish(Event::Heartbeat).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> MessageId {
        let gen = relay_types::IdGenerator::new();
        let envelope_id = gen.next_envelope_id();
        relay_types::MessageIdCounter::new().next(&envelope_id)
    }

    #[test]
    fn subscriber_receives_published_events_in_order() {
        futures::executor::block_on(async {
            let bus = EventBus::new(8);
            let sub = bus.subscribe().await;
            let message_id = id();
            bus.publish(Event::Spooled { id: message_id.clone() }).await;
            bus.publish(Event::SendingStarted { id: message_id.clone() }).await;

            match sub.recv().await {
                Some(Event::Spooled { id }) => assert_eq!(id, message_id),
                other => panic!("unexpected: {:?}", other.is_some()),
            }
            match sub.recv().await {
                Some(Event::SendingStarted { id }) => assert_eq!(id, message_id),
                other => panic!("unexpected: {:?}", other.is_some()),
            }
        });
    }

    #[test]
    fn full_subscriber_queue_is_dropped_not_blocked() {
        futures::executor::block_on(async {
            let bus = EventBus::new(1);
            let sub = bus.subscribe().await;
            let message_id = id();

            bus.publish(Event::Spooled { id: message_id.clone() }).await;
            // Channel now full (capacity 1); these must not block.
            bus.publish(Event::SendingStarted { id: message_id.clone() }).await;
            bus.publish(Event::Frozen { id: message_id.clone() }).await;

            assert!(matches!(sub.recv().await, Some(Event::Spooled { .. })));
            // Space freed up: the next recv should see the coalesced drop count.
            match sub.recv().await {
                Some(Event::Dropped(n)) => assert_eq!(n, 2),
                other => panic!("expected Dropped(2), got {:?}", other.is_some()),
            }
        });
    }
}
