use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relay_types::{EnvelopeId, MessageId, MessageRecord, Queue};

/// One directory entry: an id sitting in a given queue. Does not itself
/// guarantee the entry still exists by the time it's used; callers always go
/// back through [`Storage::with_entry`] or the read-only accessors to find
/// out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub id: MessageId,
    pub queue: Queue,
    pub spool_date: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct EntryStat {
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// Error taxonomy for the storage layer (§7): filesystem failures, lock
/// contention, and the two forms of state corruption this layer refuses to
/// paper over.
#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("I/O error")]
    Io(#[source] std::io::Error),
    #[error("entry is locked by another task")]
    Locked,
    #[error("on-disk record diverged from the expected value")]
    DiskDivergence,
    #[error("on-disk record is not valid: {0}")]
    RecordCorrupt(String),
    #[error("could not reserve a unique id after {0} attempts")]
    NameCollision(u32),
    #[error("spool root {0} is held by another process")]
    SpoolBusy(String),
    #[error("spool root and its staging directory are not on the same filesystem")]
    CrossDevice,
    #[error("no entry with id {0} was found in any queue")]
    NotFound(MessageId),
}

impl From<std::io::Error> for SpoolError {
    fn from(e: std::io::Error) -> SpoolError {
        SpoolError::Io(e)
    }
}

/// What a [`Storage::with_entry`] mutation closure decided to do with the
/// record it was handed.
pub enum Mutation {
    /// Rewrite the record. If its status maps to a different queue than the
    /// entry's current one, the storage layer renames it across queue
    /// directories atomically.
    Save(MessageRecord),
    /// Unlink the record and its body.
    Remove,
    /// Release the lock; nothing changed.
    Keep,
}

/// The crash-safe on-disk spool (§4.1). Implementations own the directory
/// layout and locking; everything above this trait only ever touches
/// records through it.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reserves a fresh unique id derived from `seed`, without yet writing a
    /// record under it.
    async fn reserve(&self, seed: &EnvelopeId) -> Result<MessageId, SpoolError>;

    /// Writes the record and body for a freshly reserved id and releases its
    /// reservation. `record.id` must equal `id`.
    async fn enqueue(&self, id: MessageId, record: &MessageRecord, body: &[u8]) -> Result<(), SpoolError>;

    /// Lists the entries currently in `queue`. A snapshot: mutations to the
    /// queue after this call don't retroactively change the returned list.
    async fn list(&self, queue: Queue) -> Result<Vec<Entry>, SpoolError>;

    /// Reads `entry`'s current record without taking its lock. Callers that
    /// want to act on a stable snapshot pass the result back in as
    /// `with_entry`'s `expected` so a concurrent writer is caught as
    /// [`SpoolError::DiskDivergence`] instead of silently clobbered.
    async fn read_record(&self, entry: &Entry) -> Result<MessageRecord, SpoolError>;

    /// Acquires `entry`'s exclusive lock, reads its current record, and
    /// hands it to `f`. Applies whatever [`Mutation`] `f` returns, then
    /// releases the lock. Gives up with [`SpoolError::Locked`] if the lock
    /// is still held by someone else when `give_up` elapses.
    ///
    /// If `expected` is `Some`, the freshly-read on-disk record is compared
    /// against it before `f` runs; a mismatch fails the whole call with
    /// [`SpoolError::DiskDivergence`] without invoking `f`, so a mutation
    /// decided against a stale in-memory copy is never applied.
    async fn with_entry(
        &self,
        entry: &Entry,
        expected: Option<&MessageRecord>,
        give_up: Instant,
        f: Box<dyn FnOnce(MessageRecord) -> Mutation + Send>,
    ) -> Result<(), SpoolError>;

    /// Metadata for an entry's body file. Read-only, does not take the lock.
    async fn stat(&self, entry: &Entry) -> Result<EntryStat, SpoolError>;

    /// Reads an entry's raw message body. Read-only, does not take the lock.
    async fn read_body(&self, entry: &Entry) -> Result<Vec<u8>, SpoolError>;
}
