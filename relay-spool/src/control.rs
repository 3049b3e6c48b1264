use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use relay_client::{ClientCache, Connector};
use relay_types::{MessageId, MessageRecord, Queue, RetryIntervals};

use crate::{
    events::{Event, EventBus},
    record_ops,
    storage::Storage,
};

/// Per-queue size and age snapshot returned by the `status` RPC (§4.8).
#[derive(Clone, Debug, Default)]
pub struct SpoolStatus {
    pub queue_sizes: HashMap<Queue, usize>,
    /// Age (now - spool_date) of the oldest entry in each non-empty queue.
    pub oldest_entry_age: HashMap<Queue, ChronoDuration>,
}

/// The operator-facing control surface over a [`Storage`] and its paired
/// [`ClientCache`] (§4.8). All operations are idempotent per id.
pub struct ControlSurface<S: Storage, Cn: Connector> {
    storage: Arc<S>,
    cache: Arc<ClientCache<Cn>>,
    events: Arc<EventBus>,
    per_op_give_up: std::time::Duration,
}

impl<S: Storage, Cn: Connector> ControlSurface<S, Cn> {
    pub fn new(storage: Arc<S>, cache: Arc<ClientCache<Cn>>, events: Arc<EventBus>) -> ControlSurface<S, Cn> {
        ControlSurface {
            storage,
            cache,
            events,
            per_op_give_up: std::time::Duration::from_secs(5),
        }
    }

    fn give_up(&self) -> Instant {
        Instant::now() + self.per_op_give_up
    }

    pub async fn status(&self) -> Result<SpoolStatus, crate::storage::SpoolError> {
        let now: DateTime<Utc> = Utc::now();
        let mut out = SpoolStatus::default();
        for queue in Queue::ALL {
            let entries = self.storage.list(queue).await?;
            out.queue_sizes.insert(queue, entries.len());
            if let Some(oldest) = entries.iter().map(|e| e.spool_date).min() {
                out.oldest_entry_age.insert(queue, now - oldest);
            }
        }
        Ok(out)
    }

    pub async fn freeze(&self, ids: &[MessageId]) -> Vec<Result<(), crate::storage::SpoolError>> {
        self.for_each_id(ids, |entry, record| {
            let storage = self.storage.clone();
            let events = self.events.clone();
            let give_up = self.give_up();
            async move {
                record_ops::freeze(&*storage, &entry, &record, give_up).await?;
                events.publish(Event::Frozen { id: entry.id.clone() }).await;
                Ok(())
            }
        })
        .await
    }

    pub async fn send(&self, retry_intervals: RetryIntervals, ids: &[MessageId]) -> Vec<Result<(), crate::storage::SpoolError>> {
        self.for_each_id(ids, |entry, record| {
            let storage = self.storage.clone();
            let events = self.events.clone();
            let give_up = self.give_up();
            let extra = retry_intervals.clone();
            async move {
                record_ops::mark_for_send_now(&*storage, &entry, &record, extra, give_up).await?;
                events
                    .publish(Event::RecipientsUpdated {
                        id: entry.id.clone(),
                        remaining: record.remaining_recipients.clone(),
                        failed: record.failed_recipients.clone(),
                    })
                    .await;
                Ok(())
            }
        })
        .await
    }

    pub async fn remove(&self, ids: &[MessageId]) -> Vec<Result<(), crate::storage::SpoolError>> {
        self.for_each_id(ids, |entry, record| {
            let storage = self.storage.clone();
            let events = self.events.clone();
            let give_up = self.give_up();
            async move {
                record_ops::remove(&*storage, &entry, &record, give_up).await?;
                events.publish(Event::Removed { id: entry.id.clone() }).await;
                Ok(())
            }
        })
        .await
    }

    pub async fn recover(&self, ids: &[MessageId]) -> Vec<Result<(), crate::storage::SpoolError>> {
        self.for_each_id(ids, |entry, record| {
            let storage = self.storage.clone();
            let events = self.events.clone();
            let give_up = self.give_up();
            async move {
                record_ops::recover_entry(&*storage, &entry, &record, give_up).await?;
                events.publish(Event::Frozen { id: entry.id.clone() }).await;
                Ok(())
            }
        })
        .await
    }

    pub async fn set_max_concurrent_send_jobs(&self, n: usize) {
        self.cache.resize(n).await;
    }

    /// Finds the queue each requested id is currently sitting in (scanning
    /// every queue, since the caller doesn't know which one), reads its
    /// current record, and runs `op` against both. Ids not found anywhere
    /// are reported as an error per id rather than failing the whole batch.
    /// The record handed to `op` is the in-memory snapshot `record_ops`
    /// compares against the on-disk copy once the lock is acquired, so a
    /// write racing this lookup is caught as `DiskDivergence` instead of
    /// silently overwritten.
    async fn for_each_id<F, Fut>(&self, ids: &[MessageId], op: F) -> Vec<Result<(), crate::storage::SpoolError>>
    where
        F: Fn(crate::storage::Entry, MessageRecord) -> Fut,
        Fut: std::future::Future<Output = Result<(), crate::storage::SpoolError>>,
    {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            match self.find_entry(id).await {
                Ok(Some(entry)) => match self.storage.read_record(&entry).await {
                    Ok(record) => results.push(op(entry, record).await),
                    Err(e) => results.push(Err(e)),
                },
                Ok(None) => results.push(Err(crate::storage::SpoolError::NotFound(id.clone()))),
                Err(e) => results.push(Err(e)),
            }
        }
        results
    }

    async fn find_entry(&self, id: &MessageId) -> Result<Option<crate::storage::Entry>, crate::storage::SpoolError> {
        for queue in Queue::ALL {
            let entries = self.storage.list(queue).await?;
            if let Some(entry) = entries.into_iter().find(|e| &e.id == id) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use relay_client::ConnectError;
    use relay_types::{Address, EmailAddress, EnvelopeInfo, Flows, RetryIntervals, Status};

    use super::*;
    use crate::storage::{Entry, EntryStat, Mutation, SpoolError};

    struct MemoryStorage {
        entries: std::sync::Mutex<HashMap<MessageId, (Queue, MessageRecord)>>,
    }

    impl MemoryStorage {
        fn new() -> MemoryStorage {
            MemoryStorage {
                entries: std::sync::Mutex::new(HashMap::new()),
            }
        }

        fn insert(&self, record: MessageRecord) {
            let queue = record.queue().expect("fresh record must have a queue");
            self.entries.lock().unwrap().insert(record.id.clone(), (queue, record));
        }
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn reserve(&self, _seed: &relay_types::EnvelopeId) -> Result<MessageId, SpoolError> {
            unimplemented!("not exercised by these tests")
        }

        async fn enqueue(&self, _id: MessageId, _record: &MessageRecord, _body: &[u8]) -> Result<(), SpoolError> {
            unimplemented!("not exercised by these tests")
        }

        async fn list(&self, queue: Queue) -> Result<Vec<Entry>, SpoolError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .values()
                .filter(|(q, _)| *q == queue)
                .map(|(q, r)| Entry { id: r.id.clone(), queue: *q, spool_date: r.spool_date })
                .collect())
        }

        async fn read_record(&self, entry: &Entry) -> Result<MessageRecord, SpoolError> {
            self.entries
                .lock()
                .unwrap()
                .get(&entry.id)
                .map(|(_, r)| r.clone())
                .ok_or_else(|| SpoolError::NotFound(entry.id.clone()))
        }

        async fn with_entry(
            &self,
            entry: &Entry,
            expected: Option<&MessageRecord>,
            _give_up: Instant,
            f: Box<dyn FnOnce(MessageRecord) -> Mutation + Send>,
        ) -> Result<(), SpoolError> {
            let mut entries = self.entries.lock().unwrap();
            let (_, record) = entries.get(&entry.id).ok_or_else(|| SpoolError::NotFound(entry.id.clone()))?;
            let record = record.clone();
            if let Some(expected) = expected {
                if expected != &record {
                    return Err(SpoolError::DiskDivergence);
                }
            }
            match f(record) {
                Mutation::Save(new_record) => {
                    let queue = new_record.queue().unwrap_or(Queue::Removed);
                    entries.insert(entry.id.clone(), (queue, new_record));
                }
                Mutation::Remove => {
                    entries.remove(&entry.id);
                }
                Mutation::Keep => {}
            }
            Ok(())
        }

        async fn stat(&self, _entry: &Entry) -> Result<EntryStat, SpoolError> {
            unimplemented!("not exercised by these tests")
        }

        async fn read_body(&self, _entry: &Entry) -> Result<Vec<u8>, SpoolError> {
            unimplemented!("not exercised by these tests")
        }
    }

    struct StubConnection;

    struct StubConnector;

    #[async_trait]
    impl Connector for StubConnector {
        type Connection = StubConnection;

        async fn connect(&self, _address: &Address) -> Result<StubConnection, ConnectError> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).unwrap()
    }

    fn make_record() -> MessageRecord {
        let gen = relay_types::IdGenerator::new();
        let envelope_id = gen.next_envelope_id();
        let counter = relay_types::MessageIdCounter::new();
        let id = counter.next(&envelope_id);
        let envelope_info = EnvelopeInfo::new(Some(addr("a@x.com")), vec![addr("b@y.com")]);
        MessageRecord::new(
            id,
            envelope_id,
            "active",
            vec![Address::new("y.com", 25)],
            RetryIntervals::default(),
            envelope_info,
            Flows::new(),
            Utc::now(),
        )
    }

    #[test]
    fn freeze_persists_and_publishes_frozen() {
        futures::executor::block_on(async {
            let storage = Arc::new(MemoryStorage::new());
            let record = make_record();
            let id = record.id.clone();
            storage.insert(record);

            let cache = Arc::new(ClientCache::new(StubConnector, 1, 1));
            let events = Arc::new(EventBus::new(8));
            let sub = events.subscribe().await;
            let control = ControlSurface::new(storage.clone(), cache, events);

            let results = control.freeze(&[id.clone()]).await;
            assert!(results[0].is_ok());
            assert_eq!(storage.entries.lock().unwrap().get(&id).unwrap().1.status, Status::Frozen);

            match sub.recv().await {
                Some(Event::Frozen { id: got }) => assert_eq!(got, id),
                other => panic!("expected Frozen, got {:?}", other.is_some()),
            }
        });
    }

    #[test]
    fn remove_publishes_removed_and_a_stale_snapshot_diverges() {
        futures::executor::block_on(async {
            let storage = Arc::new(MemoryStorage::new());
            let record = make_record();
            let id = record.id.clone();
            storage.insert(record.clone());

            let cache = Arc::new(ClientCache::new(StubConnector, 1, 1));
            let events = Arc::new(EventBus::new(8));
            let sub = events.subscribe().await;
            let control = ControlSurface::new(storage.clone(), cache, events);

            // A concurrent mutation lands between the control surface's
            // read and its own attempt to act, so this stale call must
            // fail rather than clobber the newer write.
            let entry = Entry { id: id.clone(), queue: Queue::Active, spool_date: record.spool_date };
            let give_up = Instant::now() + std::time::Duration::from_secs(1);
            storage
                .with_entry(&entry, None, give_up, Box::new(|mut r| {
                    r.retry_intervals = r.retry_intervals.prepend([std::time::Duration::from_secs(1)]);
                    Mutation::Save(r)
                }))
                .await
                .unwrap();

            let stale = record_ops::remove(&*storage, &entry, &record, give_up).await;
            assert!(matches!(stale, Err(SpoolError::DiskDivergence)));

            let results = control.remove(&[id.clone()]).await;
            assert!(results[0].is_ok());
            let entries = storage.entries.lock().unwrap();
            let (queue, stored) = entries.get(&id).expect("removed records are kept as tombstones");
            assert_eq!(*queue, Queue::Removed);
            assert_eq!(stored.status, Status::Removed);
            drop(entries);

            match sub.recv().await {
                Some(Event::Removed { id: got }) => assert_eq!(got, id),
                other => panic!("expected Removed, got {:?}", other.is_some()),
            }
        });
    }
}
