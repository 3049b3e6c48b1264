//! Filesystem storage backend for [`relay_spool::Storage`].
//!
//! Layout under the configured root:
//!
//!  - `<root>/{active,frozen,removed,quarantine}/<id>`: the record
//!  - `<root>/{active,frozen,removed,quarantine}/<id>.body`: the raw message
//!  - `<root>/registry/<id>`: empty placeholder held between `reserve` and
//!    `enqueue`, used only to detect id collisions
//!  - `<root>/.tmp/<uuid>.tmp`: staging area for write-then-rename
//!  - `<root>/.lock`: advisory lock held for the lifetime of the process
//!
//! A record and its queue directory are kept in lockstep (invariant 1 of the
//! record type): moving a record between queues renames both the record and
//! `.body` files into the new queue directory. Every write lands in `.tmp`
//! first and is renamed into place, so a crash never leaves a half-written
//! record visible under its real name.

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fs2::FileExt;
use openat::Dir;
use smol::{blocking, lock::Mutex as AsyncMutex};
use uuid::Uuid;

use relay_spool::{Entry, EntryStat, Mutation, SpoolError, Storage};
use relay_types::{EnvelopeId, MessageId, MessageRecord, Queue};

const MAX_RESERVE_ATTEMPTS: u32 = 64;
const MAX_CONCURRENT_IO: usize = 400;

struct Inner {
    queue_dirs: HashMap<Queue, Dir>,
    registry: Dir,
    tmp: Dir,
    entry_locks: AsyncMutex<HashMap<MessageId, Arc<AsyncMutex<()>>>>,
    io_throttle: smol::lock::Semaphore,
    // Held for the process's lifetime; the OS releases the advisory lock on
    // drop (process exit, or an explicit `drop(storage)`).
    _lockfile: std::fs::File,
}

/// A [`relay_spool::Storage`] implementation rooted at a single directory on
/// the local filesystem. Exclusive to one process at a time: a second
/// `FsStorage::open` against the same root fails with [`SpoolError::SpoolBusy`].
pub struct FsStorage(Arc<Inner>);

impl Clone for FsStorage {
    fn clone(&self) -> FsStorage {
        FsStorage(self.0.clone())
    }
}

impl FsStorage {
    pub async fn open(root: impl Into<PathBuf>) -> Result<FsStorage, SpoolError> {
        let root = root.into();
        blocking!({
            std::fs::create_dir_all(&root)?;
            for queue in Queue::ALL {
                std::fs::create_dir_all(root.join(queue.dir_name()))?;
            }
            std::fs::create_dir_all(root.join("registry"))?;
            std::fs::create_dir_all(root.join(".tmp"))?;

            let lockfile = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(root.join(".lock"))?;
            lockfile.try_lock_exclusive().map_err(|_| {
                SpoolError::SpoolBusy(root.display().to_string())
            })?;

            let root_dir = Dir::open(&root)?;
            let tmp = root_dir.sub_dir(".tmp")?;
            let active = root_dir.sub_dir(Queue::Active.dir_name())?;
            if tmp.metadata(".")?.stat().st_dev != active.metadata(".")?.stat().st_dev {
                return Err(SpoolError::CrossDevice);
            }

            let mut queue_dirs = HashMap::new();
            queue_dirs.insert(Queue::Active, active);
            for queue in [Queue::Frozen, Queue::Removed, Queue::Quarantine] {
                queue_dirs.insert(queue, root_dir.sub_dir(queue.dir_name())?);
            }
            let registry = root_dir.sub_dir("registry")?;

            Ok(FsStorage(Arc::new(Inner {
                queue_dirs,
                registry,
                tmp,
                entry_locks: AsyncMutex::new(HashMap::new()),
                io_throttle: smol::lock::Semaphore::new(MAX_CONCURRENT_IO),
                _lockfile: lockfile,
            })))
        })
    }

    async fn entry_lock(&self, id: &MessageId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.0.entry_locks.lock().await;
        locks.entry(id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Waits for `id`'s lock, up to `give_up`. `None` means the deadline
    /// elapsed first.
    async fn acquire_entry_lock(
        &self,
        id: &MessageId,
        give_up: Instant,
    ) -> Option<smol::lock::MutexGuardArc<()>> {
        let lock = self.entry_lock(id).await;
        if let Some(guard) = lock.try_lock_arc() {
            return Some(guard);
        }
        let now = Instant::now();
        if now >= give_up {
            return None;
        }
        let timeout = give_up - now;
        let lock_for_wait = lock.clone();
        smol::future::or(
            async move { Some(lock_for_wait.lock_arc().await) },
            async move {
                smol::Timer::after(timeout).await;
                None
            },
        )
        .await
    }

}

impl Inner {
    fn dir_for(&self, queue: Queue) -> &Dir {
        self.queue_dirs.get(&queue).expect("all four queue directories are opened at startup")
    }
}

/// Writes `contents` to a fresh temp file, fsyncs it, then renames it into
/// `target_dir` as `target_name`, replacing whatever was there. Cleans up the
/// temp file on any failure.
fn write_via_tmp(tmp: &Dir, target_dir: &Dir, target_name: &str, contents: &[u8]) -> Result<(), SpoolError> {
    let tmp_name = format!("{}.tmp", Uuid::new_v4());
    {
        let mut f = tmp.new_file(&tmp_name, 0o600).map_err(SpoolError::from)?;
        f.write_all(contents).map_err(SpoolError::from)?;
        f.sync_all().map_err(SpoolError::from)?;
    }
    let result = rename_across(tmp, &tmp_name, target_dir, target_name);
    if result.is_err() {
        let _ = tmp.remove_file(&tmp_name);
    }
    result
}

fn rename_across(from_dir: &Dir, from_name: &str, to_dir: &Dir, to_name: &str) -> Result<(), SpoolError> {
    match from_dir.rename(from_name, to_dir, to_name) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => Err(SpoolError::CrossDevice),
        Err(e) => Err(SpoolError::from(e)),
    }
}

fn remove_if_present(dir: &Dir, name: &str) -> Result<(), SpoolError> {
    match dir.remove_file(name) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SpoolError::from(e)),
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn reserve(&self, seed: &EnvelopeId) -> Result<MessageId, SpoolError> {
        let inner = self.0.clone();
        let seed = seed.clone();
        blocking!({
            for counter in 0..MAX_RESERVE_ATTEMPTS {
                let id = MessageId::new(&seed, counter);
                match inner.registry.new_file(id.as_str(), 0o600) {
                    Ok(_) => return Ok(id),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(e) => return Err(SpoolError::from(e)),
                }
            }
            Err(SpoolError::NameCollision(MAX_RESERVE_ATTEMPTS))
        })
    }

    async fn enqueue(&self, id: MessageId, record: &MessageRecord, body: &[u8]) -> Result<(), SpoolError> {
        debug_assert_eq!(&record.id, &id, "enqueue called with a record for a different id");
        let queue = record
            .queue()
            .expect("a freshly reserved record must map to a queue (never Delivered)");
        let record_json = serde_json::to_vec(record)
            .map_err(|e| SpoolError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        let body = body.to_vec();
        let inner = self.0.clone();
        self.throttled(blocking!({
            let dir = inner.dir_for(queue);
            write_via_tmp(&inner.tmp, dir, &format!("{}.body", id.as_str()), &body)?;
            write_via_tmp(&inner.tmp, dir, id.as_str(), &record_json)?;
            dir.sync_all().map_err(SpoolError::from)?;
            remove_if_present(&inner.registry, id.as_str())
        }))
        .await
    }

    async fn list(&self, queue: Queue) -> Result<Vec<Entry>, SpoolError> {
        let inner = self.0.clone();
        self.throttled(blocking!({
            let dir = inner.dir_for(queue);
            let mut out = Vec::new();
            for item in dir.list_self().map_err(SpoolError::from)? {
                let item = item.map_err(SpoolError::from)?;
                let name = item.file_name().to_string_lossy().into_owned();
                // Each entry owns two directory slots, `<id>` (the record)
                // and `<id>.body`; only the former names an entry.
                if name.ends_with(".body") {
                    continue;
                }
                let id = match MessageId::from_filename(&name) {
                    Some(id) => id,
                    None => continue,
                };
                let f = dir.open_file(&name).map_err(SpoolError::from)?;
                let record: MessageRecord =
                    serde_json::from_reader(f).map_err(|e| SpoolError::RecordCorrupt(e.to_string()))?;
                out.push(Entry { id, queue, spool_date: record.spool_date });
            }
            Ok(out)
        }))
        .await
    }

    async fn read_record(&self, entry: &Entry) -> Result<MessageRecord, SpoolError> {
        let inner = self.0.clone();
        let queue = entry.queue;
        let id = entry.id.clone();
        self.throttled(blocking!({
            let dir = inner.dir_for(queue);
            let file = match dir.open_file(id.as_str()) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SpoolError::NotFound(id.clone())),
                Err(e) => return Err(SpoolError::from(e)),
            };
            serde_json::from_reader(file).map_err(|e| SpoolError::RecordCorrupt(e.to_string()))
        }))
        .await
    }

    async fn with_entry(
        &self,
        entry: &Entry,
        expected: Option<&MessageRecord>,
        give_up: Instant,
        f: Box<dyn FnOnce(MessageRecord) -> Mutation + Send>,
    ) -> Result<(), SpoolError> {
        let _guard = match self.acquire_entry_lock(&entry.id, give_up).await {
            Some(g) => g,
            None => return Err(SpoolError::Locked),
        };
        let inner = self.0.clone();
        let queue = entry.queue;
        let id = entry.id.clone();
        self.throttled(blocking!({
            let dir = inner.dir_for(queue);
            let record_name = id.as_str();
            let file = match dir.open_file(record_name) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SpoolError::NotFound(id.clone())),
                Err(e) => return Err(SpoolError::from(e)),
            };
            let record: MessageRecord =
                serde_json::from_reader(file).map_err(|e| SpoolError::RecordCorrupt(e.to_string()))?;

            if let Some(expected) = expected {
                if expected != &record {
                    return Err(SpoolError::DiskDivergence);
                }
            }

            match f(record) {
                Mutation::Keep => Ok(()),
                Mutation::Remove => {
                    remove_if_present(dir, record_name)?;
                    remove_if_present(dir, &format!("{}.body", id.as_str()))?;
                    dir.sync_all().map_err(SpoolError::from)
                }
                Mutation::Save(new_record) => {
                    let new_queue = new_record
                        .queue()
                        .expect("a saved record must map to a queue; Delivered must go through Mutation::Remove");
                    let new_record_bytes = serde_json::to_vec(&new_record)
                        .map_err(|e| SpoolError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
                    if new_queue == queue {
                        write_via_tmp(&inner.tmp, dir, record_name, &new_record_bytes)?;
                        dir.sync_all().map_err(SpoolError::from)
                    } else {
                        let target = inner.dir_for(new_queue);
                        write_via_tmp(&inner.tmp, target, record_name, &new_record_bytes)?;
                        let body_name = format!("{}.body", id.as_str());
                        match dir.rename(&body_name, target, &body_name) {
                            Ok(()) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                                return Err(SpoolError::CrossDevice)
                            }
                            Err(e) => return Err(SpoolError::from(e)),
                        }
                        remove_if_present(dir, record_name)?;
                        target.sync_all().map_err(SpoolError::from)?;
                        dir.sync_all().map_err(SpoolError::from)
                    }
                }
            }
        }))
        .await
    }

    async fn stat(&self, entry: &Entry) -> Result<EntryStat, SpoolError> {
        let inner = self.0.clone();
        let queue = entry.queue;
        let id = entry.id.clone();
        self.throttled(blocking!({
            let dir = inner.dir_for(queue);
            let body_name = format!("{}.body", id.as_str());
            let meta = dir.metadata(&body_name).map_err(SpoolError::from)?;
            let st = meta.stat();
            Ok(EntryStat { size: st.st_size as u64, mtime: Utc.timestamp(st.st_mtime, st.st_mtime_nsec as u32) })
        }))
        .await
    }

    async fn read_body(&self, entry: &Entry) -> Result<Vec<u8>, SpoolError> {
        let inner = self.0.clone();
        let queue = entry.queue;
        let id = entry.id.clone();
        self.throttled(blocking!({
            let dir = inner.dir_for(queue);
            let mut f = dir.open_file(&format!("{}.body", id.as_str())).map_err(SpoolError::from)?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf).map_err(SpoolError::from)?;
            Ok(buf)
        }))
        .await
    }
}

impl FsStorage {
    async fn throttled<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        let _permit = self.0.io_throttle.acquire().await;
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use relay_types::{Address, EmailAddress, EnvelopeInfo, Flows, IdGenerator, RetryIntervals, Status};

    fn envelope(recipients: Vec<&str>) -> (EnvelopeId, MessageRecord) {
        let gen = IdGenerator::new();
        let envelope_id = gen.next_envelope_id();
        let info = EnvelopeInfo::new(
            Some(EmailAddress::parse("sender@example.com").unwrap()),
            recipients.into_iter().map(|r| EmailAddress::parse(r).unwrap()).collect(),
        );
        let id = MessageId::new(&envelope_id, 0);
        let record = MessageRecord::new(
            id,
            envelope_id.clone(),
            "active",
            vec![Address::new("mx.example.com", 25)],
            RetryIntervals::default(),
            info,
            Flows::new(),
            Utc::now(),
        );
        (envelope_id, record)
    }

    #[test]
    fn reserve_enqueue_list_round_trip() {
        block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let storage = FsStorage::open(dir.path().to_path_buf()).await.unwrap();

            let (envelope_id, record) = envelope(vec!["a@b.com"]);
            let reserved = storage.reserve(&envelope_id).await.unwrap();
            storage.enqueue(reserved.clone(), &record, b"hello world").await.unwrap();

            let active = storage.list(Queue::Active).await.unwrap();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].id, reserved);

            let body = storage.read_body(&active[0]).await.unwrap();
            assert_eq!(body, b"hello world");

            let stat = storage.stat(&active[0]).await.unwrap();
            assert_eq!(stat.size, 11);
        });
    }

    #[test]
    fn with_entry_moves_record_across_queue_directories_on_freeze() {
        block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let storage = FsStorage::open(dir.path().to_path_buf()).await.unwrap();

            let (envelope_id, record) = envelope(vec!["a@b.com"]);
            let id = storage.reserve(&envelope_id).await.unwrap();
            storage.enqueue(id, &record, b"body").await.unwrap();

            let entry = storage.list(Queue::Active).await.unwrap().remove(0);
            let give_up = Instant::now() + std::time::Duration::from_secs(1);
            storage
                .with_entry(
                    &entry,
                    None,
                    give_up,
                    Box::new(|mut r| {
                        r.status = Status::Frozen;
                        Mutation::Save(r)
                    }),
                )
                .await
                .unwrap();

            assert!(storage.list(Queue::Active).await.unwrap().is_empty());
            let frozen = storage.list(Queue::Frozen).await.unwrap();
            assert_eq!(frozen.len(), 1);
            assert_eq!(storage.read_body(&frozen[0]).await.unwrap(), b"body");
        });
    }

    #[test]
    fn with_entry_remove_deletes_both_files() {
        block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let storage = FsStorage::open(dir.path().to_path_buf()).await.unwrap();

            let (envelope_id, record) = envelope(vec!["a@b.com"]);
            let id = storage.reserve(&envelope_id).await.unwrap();
            storage.enqueue(id, &record, b"body").await.unwrap();

            let entry = storage.list(Queue::Active).await.unwrap().remove(0);
            let give_up = Instant::now() + std::time::Duration::from_secs(1);
            storage.with_entry(&entry, None, give_up, Box::new(|_| Mutation::Remove)).await.unwrap();

            assert!(storage.list(Queue::Active).await.unwrap().is_empty());
        });
    }

    #[test]
    fn with_entry_rejects_a_stale_expected_record() {
        block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let storage = FsStorage::open(dir.path().to_path_buf()).await.unwrap();

            let (envelope_id, record) = envelope(vec!["a@b.com"]);
            let id = storage.reserve(&envelope_id).await.unwrap();
            storage.enqueue(id, &record, b"body").await.unwrap();

            let entry = storage.list(Queue::Active).await.unwrap().remove(0);
            let stale = storage.read_record(&entry).await.unwrap();

            // Someone else mutates the record between our read and our
            // attempt to act on it.
            let give_up = Instant::now() + std::time::Duration::from_secs(1);
            storage
                .with_entry(&entry, None, give_up, Box::new(|mut r| {
                    r.status = Status::Frozen;
                    Mutation::Save(r)
                }))
                .await
                .unwrap();

            let entry = storage.list(Queue::Frozen).await.unwrap().remove(0);
            let result = storage
                .with_entry(&entry, Some(&stale), give_up, Box::new(|r| Mutation::Save(r)))
                .await;
            assert!(matches!(result, Err(SpoolError::DiskDivergence)));
        });
    }

    #[test]
    fn reopening_a_held_root_fails_with_spool_busy() {
        block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let _first = FsStorage::open(dir.path().to_path_buf()).await.unwrap();
            let second = FsStorage::open(dir.path().to_path_buf()).await;
            assert!(matches!(second, Err(SpoolError::SpoolBusy(_))));
        });
    }

    #[test]
    fn concurrent_with_entry_on_same_id_serializes() {
        block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let storage = FsStorage::open(dir.path().to_path_buf()).await.unwrap();

            let (envelope_id, record) = envelope(vec!["a@b.com"]);
            let id = storage.reserve(&envelope_id).await.unwrap();
            storage.enqueue(id, &record, b"body").await.unwrap();
            let entry = storage.list(Queue::Active).await.unwrap().remove(0);

            let give_up = Instant::now() + std::time::Duration::from_millis(50);
            let second_entry = entry.clone();
            let storage2 = storage.clone();
            let blocked = smol::spawn(async move {
                storage2.with_entry(&second_entry, None, give_up, Box::new(|r| Mutation::Save(r))).await
            });

            let inner_give_up = Instant::now() + std::time::Duration::from_secs(1);
            storage
                .with_entry(
                    &entry,
                    None,
                    inner_give_up,
                    Box::new(|r| {
                        std::thread::sleep(std::time::Duration::from_millis(100));
                        Mutation::Save(r)
                    }),
                )
                .await
                .unwrap();

            assert!(matches!(blocked.await, Err(SpoolError::Locked)));
        });
    }
}
