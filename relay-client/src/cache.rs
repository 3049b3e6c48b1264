use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    time::Instant,
};

use async_trait::async_trait;
use smol::lock::{Mutex, Semaphore};

use relay_types::Address;

use crate::error::ConnectError;

/// Establishes connections to a next-hop [`Address`]. The wire protocol
/// itself (EHLO/STARTTLS/...) is out of scope here; this is only the seam
/// [`ClientCache`] dials through, so that the cache's pooling logic doesn't
/// need to know anything about sockets or TLS.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send;

    async fn connect(&self, address: &Address) -> Result<Self::Connection, ConnectError>;

    /// Whether a pooled connection is still worth reusing. Checked both
    /// before handing a connection to a caller and before putting one back.
    /// The default assumes connections stay healthy until told otherwise by
    /// the caller's own use of them (e.g. after observing an I/O error), so
    /// most connectors never need to override this.
    fn is_healthy(&self, _conn: &Self::Connection) -> bool {
        true
    }
}

struct Pooled<C> {
    conn: C,
    uses: u32,
}

struct Inner<C> {
    idle: HashMap<Address, VecDeque<Pooled<C>>>,
    closed: bool,
}

/// Outcome of [`ClientCache::with_connection`].
pub enum WithConnectionOutcome<T> {
    Ok(Address, T),
    ErrorOpeningResource(ConnectError),
    GaveUpWaiting,
    CacheClosed,
}

/// A bounded pool of outbound connections, keyed by next-hop [`Address`].
///
/// The bound is a single count of connections (idle plus in-use) shared
/// across every address the cache serves, configured once at construction
/// time (this is the knob the control surface calls
/// `max_concurrent_send_jobs`). A connection counts against that bound for
/// its whole lifetime, whether it is currently idle in the pool or on loan
/// to a caller; acquiring a fresh one and reusing an idle one are therefore
/// symmetric with respect to the bound.
pub struct ClientCache<Cn: Connector> {
    connector: Cn,
    inner: Mutex<Inner<Cn::Connection>>,
    permits: Semaphore,
    max_permits: Mutex<usize>,
    max_uses: u32,
}

impl<Cn: Connector> ClientCache<Cn> {
    pub fn new(connector: Cn, max_concurrent_connections: usize, max_uses_per_connection: u32) -> ClientCache<Cn> {
        ClientCache {
            connector,
            inner: Mutex::new(Inner {
                idle: HashMap::new(),
                closed: false,
            }),
            permits: Semaphore::new(max_concurrent_connections),
            max_permits: Mutex::new(max_concurrent_connections),
            max_uses: max_uses_per_connection,
        }
    }

    /// Resizes the pool's bound (the control surface's
    /// `set_max_concurrent_send_jobs`). Growing takes effect immediately.
    /// Shrinking reclaims whatever permits are idle right now; any excess
    /// still on loan keeps counting against the old bound until its
    /// connection is dropped rather than returned to the pool, at which
    /// point the permit is released rather than recycled (see `give_back`).
    pub async fn resize(&self, new_max: usize) {
        let mut current = self.max_permits.lock().await;
        if new_max > *current {
            self.permits.add_permits(new_max - *current);
        } else {
            let mut reclaimed = 0;
            while reclaimed < *current - new_max {
                match self.permits.try_acquire() {
                    Some(guard) => {
                        std::mem::forget(guard);
                        reclaimed += 1;
                    }
                    None => break,
                }
            }
        }
        *current = new_max;
    }

    /// Closes the cache: every future `with_connection` call returns
    /// `CacheClosed` immediately, and any connections currently idle in the
    /// pool are dropped and their permits released. Connections already on
    /// loan to an in-flight `with_connection` call are returned to
    /// `give_back` as usual, which then drops them since `closed` is set.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        for (_, mut q) in inner.idle.drain() {
            while q.pop_front().is_some() {
                self.permits.add_permits(1);
            }
        }
    }

    /// Runs `f` against a connection to one of `candidates`, reusing an idle
    /// one if a healthy one is available, opening a fresh one to the first
    /// reachable candidate otherwise, and waiting for a permit to free up if
    /// the cache is already at capacity. Gives up and returns `GaveUpWaiting`
    /// once `give_up` elapses; in particular `give_up` already in the past
    /// gives up immediately, without attempting anything.
    pub async fn with_connection<T, F, Fut>(&self, candidates: &[Address], give_up: Instant, f: F) -> WithConnectionOutcome<T>
    where
        F: FnOnce(&mut Cn::Connection) -> Fut,
        Fut: Future<Output = T>,
    {
        debug_assert!(!candidates.is_empty(), "with_connection needs at least one candidate");

        if Instant::now() >= give_up {
            return WithConnectionOutcome::GaveUpWaiting;
        }

        loop {
            if self.inner.lock().await.closed {
                return WithConnectionOutcome::CacheClosed;
            }

            if let Some((addr, mut pooled)) = self.take_idle(candidates).await {
                let result = f(&mut pooled.conn).await;
                pooled.uses += 1;
                self.give_back(addr.clone(), pooled).await;
                return WithConnectionOutcome::Ok(addr, result);
            }

            let now = Instant::now();
            if now >= give_up {
                return WithConnectionOutcome::GaveUpWaiting;
            }

            let guard = match self.permits.try_acquire() {
                Some(g) => g,
                None => {
                    let timeout = give_up - now;
                    let got_permit = smol::future::or(
                        async {
                            self.permits.acquire().await;
                            true
                        },
                        async {
                            smol::Timer::after(timeout).await;
                            false
                        },
                    )
                    .await;
                    if !got_permit {
                        return WithConnectionOutcome::GaveUpWaiting;
                    }
                    // A permit came free and was immediately released again
                    // by the probe above; loop back around so the idle pool
                    // (possibly refilled by another waiter in the meantime)
                    // and a fresh try_acquire both get a fair look.
                    continue;
                }
            };

            let mut last_err = None;
            for addr in candidates {
                match self.connector.connect(addr).await {
                    Ok(conn) => {
                        std::mem::forget(guard);
                        let mut pooled = Pooled { conn, uses: 0 };
                        let result = f(&mut pooled.conn).await;
                        pooled.uses += 1;
                        self.give_back(addr.clone(), pooled).await;
                        return WithConnectionOutcome::Ok(addr.clone(), result);
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            // `guard` drops here: none of the candidates were reachable, so
            // the permit it held goes straight back to the pool.
            return WithConnectionOutcome::ErrorOpeningResource(
                last_err.expect("candidates must not be empty"),
            );
        }
    }

    async fn take_idle(&self, candidates: &[Address]) -> Option<(Address, Pooled<Cn::Connection>)> {
        let mut inner = self.inner.lock().await;
        for addr in candidates {
            if let Some(q) = inner.idle.get_mut(addr) {
                while let Some(pooled) = q.pop_front() {
                    if self.connector.is_healthy(&pooled.conn) && pooled.uses < self.max_uses {
                        return Some((addr.clone(), pooled));
                    }
                    self.permits.add_permits(1);
                }
            }
        }
        None
    }

    async fn give_back(&self, addr: Address, pooled: Pooled<Cn::Connection>) {
        if !self.connector.is_healthy(&pooled.conn) || pooled.uses >= self.max_uses {
            self.permits.add_permits(1);
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.closed {
            self.permits.add_permits(1);
            return;
        }
        inner.idle.entry(addr).or_insert_with(VecDeque::new).push_back(pooled);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingConnector {
        opened: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Connection = u32;

        async fn connect(&self, address: &Address) -> Result<u32, ConnectError> {
            if self.fail {
                return Err(ConnectError::Other(address.clone(), "refused".into()));
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn addr() -> Address {
        Address::new("mx.example.com", 25)
    }

    #[test]
    fn opens_then_reuses_a_single_connection() {
        futures::executor::block_on(async {
            let cache = ClientCache::new(
                CountingConnector {
                    opened: AtomicU32::new(0),
                    fail: false,
                },
                4,
                100,
            );
            let candidates = [addr()];
            let give_up = Instant::now() + std::time::Duration::from_secs(5);

            let first = cache.with_connection(&candidates, give_up, |c| async move { *c }).await;
            let second = cache.with_connection(&candidates, give_up, |c| async move { *c }).await;

            match (first, second) {
                (WithConnectionOutcome::Ok(_, a), WithConnectionOutcome::Ok(_, b)) => {
                    assert_eq!(a, 0);
                    assert_eq!(b, 0, "second call should reuse the pooled connection, not open a new one");
                }
                _ => panic!("expected both calls to succeed"),
            }
        });
    }

    #[test]
    fn give_up_in_the_past_returns_immediately_without_connecting() {
        futures::executor::block_on(async {
            let cache = ClientCache::new(
                CountingConnector {
                    opened: AtomicU32::new(0),
                    fail: false,
                },
                4,
                100,
            );
            let candidates = [addr()];
            let already_past = Instant::now() - std::time::Duration::from_secs(1);

            let outcome = cache.with_connection(&candidates, already_past, |c| async move { *c }).await;
            assert!(matches!(outcome, WithConnectionOutcome::GaveUpWaiting));
            assert_eq!(cache.connector.opened.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn unreachable_candidate_reports_error_opening_resource() {
        futures::executor::block_on(async {
            let cache = ClientCache::new(
                CountingConnector {
                    opened: AtomicU32::new(0),
                    fail: true,
                },
                4,
                100,
            );
            let candidates = [addr()];
            let give_up = Instant::now() + std::time::Duration::from_secs(5);

            let outcome = cache.with_connection(&candidates, give_up, |c| async move { *c }).await;
            assert!(matches!(outcome, WithConnectionOutcome::ErrorOpeningResource(_)));
        });
    }

    #[test]
    fn closed_cache_rejects_further_use() {
        futures::executor::block_on(async {
            let cache = ClientCache::new(
                CountingConnector {
                    opened: AtomicU32::new(0),
                    fail: false,
                },
                4,
                100,
            );
            cache.close().await;
            let candidates = [addr()];
            let give_up = Instant::now() + std::time::Duration::from_secs(5);

            let outcome = cache.with_connection(&candidates, give_up, |c| async move { *c }).await;
            assert!(matches!(outcome, WithConnectionOutcome::CacheClosed));
        });
    }

    #[test]
    fn connection_past_max_uses_is_not_reused() {
        futures::executor::block_on(async {
            let cache = ClientCache::new(
                CountingConnector {
                    opened: AtomicU32::new(0),
                    fail: false,
                },
                4,
                1,
            );
            let candidates = [addr()];
            let give_up = Instant::now() + std::time::Duration::from_secs(5);

            let first = cache.with_connection(&candidates, give_up, |c| async move { *c }).await;
            let second = cache.with_connection(&candidates, give_up, |c| async move { *c }).await;

            match (first, second) {
                (WithConnectionOutcome::Ok(_, a), WithConnectionOutcome::Ok(_, b)) => {
                    assert_eq!(a, 0);
                    assert_eq!(b, 1, "connection at its max-use limit must not be handed out again");
                }
                _ => panic!("expected both calls to succeed"),
            }
        });
    }
}
