//! Bounded connection pooling for txscope.
//!
//! [`Pool`] hands out connections under a hard concurrency cap. An idle
//! connection is reused when one is available; otherwise a new one is created
//! through the caller-supplied async factory while total occupancy is below
//! `max_size`; otherwise the acquirer suspends in a FIFO queue until a
//! release wakes it.
//!
//! # Design Philosophy
//!
//! - **Exclusive hand-out**: a connection belongs to exactly one
//!   [`PooledConnection`] guard at a time.
//! - **Release is control flow**: the guard returns its connection on drop,
//!   so every exit path of the holder balances the books.
//! - **Cancellation aware**: the acquire loop checks the [`Cx`] cancel
//!   reason, so a cancelled request never sits in the wait queue.
//!
//! # Example
//!
//! ```ignore
//! let pool = Pool::new(PoolConfig::new(4));
//! let conn = pool.acquire(&cx, || MemConnection::connect(&db)).await?;
//! let rows = conn.query(&cx, "SELECT 1", &[]).await?;
//! drop(conn); // back to the idle set
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};
use txscope_core::error::{Error, PoolErrorKind};
use txscope_core::{Connection, DbConfig};

// ============================================================================
// Configuration
// ============================================================================

/// Pool sizing and recycling knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Hard cap on concurrent connections (idle + in use).
    pub max_size: usize,
    /// Drop connections older than this instead of reusing them.
    pub recycle_after: Option<Duration>,
}

impl PoolConfig {
    /// A pool capped at `max_size` connections, with recycling disabled.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            recycle_after: None,
        }
    }

    /// Set the connection recycle age.
    #[must_use]
    pub fn recycle_after(mut self, age: Duration) -> Self {
        self.recycle_after = Some(age);
        self
    }

    fn expired(&self, created_at: Instant) -> bool {
        match self.recycle_after {
            Some(age) => created_at.elapsed() >= age,
            None => false,
        }
    }
}

impl From<&DbConfig> for PoolConfig {
    fn from(cfg: &DbConfig) -> Self {
        Self {
            max_size: cfg.max_pool_size,
            recycle_after: cfg.recycle_after,
        }
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct IdleConn<C> {
    conn: C,
    created_at: Instant,
}

/// One suspended acquirer. `woken` is the hand-off token: a release marks the
/// front waiter woken and wakes its task; the waiter consumes the token by
/// retrying the acquire loop.
struct WaiterSlot {
    woken: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

struct PoolState<C> {
    idle: Vec<IdleConn<C>>,
    in_use: usize,
    waiters: VecDeque<Arc<WaiterSlot>>,
    closed: bool,
}

struct Counters {
    acquires: AtomicU64,
    releases: AtomicU64,
    created: AtomicU64,
    recycled: AtomicU64,
    discarded: AtomicU64,
}

struct PoolInner<C> {
    state: Mutex<PoolState<C>>,
    config: PoolConfig,
    counters: Counters,
}

impl<C> PoolInner<C> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wake the longest-waiting acquirer, if any.
fn wake_one<C>(state: &mut PoolState<C>) {
    if let Some(slot) = state.waiters.pop_front() {
        slot.woken.store(true, Ordering::SeqCst);
        let waker = slot
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

fn release<C>(inner: &Arc<PoolInner<C>>, slot: IdleConn<C>) {
    let recycled = {
        let mut state = inner.lock_state();
        state.in_use -= 1;
        let retire = state.closed || inner.config.expired(slot.created_at);
        if retire {
            // Dropped outside the lock.
        } else {
            state.idle.push(slot);
        }
        wake_one(&mut state);
        retire
    };
    inner.counters.releases.fetch_add(1, Ordering::Relaxed);
    if recycled {
        inner.counters.recycled.fetch_add(1, Ordering::Relaxed);
    }
}

fn forget_in_use<C>(inner: &Arc<PoolInner<C>>) {
    let mut state = inner.lock_state();
    state.in_use -= 1;
    wake_one(&mut state);
}

// ============================================================================
// Pool
// ============================================================================

/// A bounded pool of database connections.
pub struct Pool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Pool<C> {
    /// Create a pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_use: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                config,
                counters: Counters {
                    acquires: AtomicU64::new(0),
                    releases: AtomicU64::new(0),
                    created: AtomicU64::new(0),
                    recycled: AtomicU64::new(0),
                    discarded: AtomicU64::new(0),
                },
            }),
        }
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a connection, suspending while the pool is at capacity.
    ///
    /// `factory` is called to establish a fresh connection when the pool
    /// grows. A factory failure surfaces to this acquirer only; the reserved
    /// capacity is returned and the next waiter is woken.
    pub async fn acquire<F, Fut>(&self, cx: &Cx, factory: F) -> Outcome<PooledConnection<C>, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<C, Error>>,
    {
        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }

            match self.next_step() {
                Step::Reuse(slot) => {
                    self.inner.counters.acquires.fetch_add(1, Ordering::Relaxed);
                    return Outcome::Ok(PooledConnection {
                        inner: Arc::clone(&self.inner),
                        slot: Some(slot),
                    });
                }
                Step::Grow => match factory().await {
                    Outcome::Ok(conn) => {
                        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                        self.inner.counters.acquires.fetch_add(1, Ordering::Relaxed);
                        return Outcome::Ok(PooledConnection {
                            inner: Arc::clone(&self.inner),
                            slot: Some(IdleConn {
                                conn,
                                created_at: Instant::now(),
                            }),
                        });
                    }
                    Outcome::Err(e) => {
                        forget_in_use(&self.inner);
                        return Outcome::Err(e);
                    }
                    Outcome::Cancelled(r) => {
                        forget_in_use(&self.inner);
                        return Outcome::Cancelled(r);
                    }
                    Outcome::Panicked(p) => {
                        forget_in_use(&self.inner);
                        return Outcome::Panicked(p);
                    }
                },
                Step::Wait(slot) => {
                    tracing::debug!(max_size = self.inner.config.max_size, "pool at capacity, waiting");
                    AcquireWait {
                        inner: Arc::clone(&self.inner),
                        slot,
                    }
                    .await;
                }
                Step::Closed => {
                    return Outcome::Err(Error::pool(PoolErrorKind::Closed, "pool is closed"));
                }
            }
        }
    }

    /// Acquire an idle connection without waiting.
    ///
    /// Fails with [`PoolErrorKind::Exhausted`] when nothing is idle; this
    /// never grows the pool, since growing requires an async factory.
    pub fn try_acquire(&self) -> Result<PooledConnection<C>, Error> {
        let slot = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(Error::pool(PoolErrorKind::Closed, "pool is closed"));
            }
            loop {
                match state.idle.pop() {
                    Some(slot) if self.inner.config.expired(slot.created_at) => {
                        self.inner.counters.recycled.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(slot) => {
                        state.in_use += 1;
                        break slot;
                    }
                    None => {
                        return Err(Error::pool(
                            PoolErrorKind::Exhausted,
                            "no idle connection available",
                        ));
                    }
                }
            }
        };
        self.inner.counters.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            inner: Arc::clone(&self.inner),
            slot: Some(slot),
        })
    }

    /// Close the pool: drop idle connections, fail queued acquirers, and
    /// retire in-use connections as they come back.
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            let waiters = std::mem::take(&mut state.waiters);
            (idle, waiters)
        };
        for slot in &waiters {
            slot.woken.store(true, Ordering::SeqCst);
            let waker = slot
                .waker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        drop(idle);
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// A snapshot of pool occupancy and lifetime counters.
    pub fn stats(&self) -> PoolStats {
        let (idle, in_use, waiting) = {
            let state = self.inner.lock_state();
            (state.idle.len(), state.in_use, state.waiters.len())
        };
        let c = &self.inner.counters;
        PoolStats {
            idle,
            in_use,
            waiting,
            acquires: c.acquires.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
            created: c.created.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }

    fn next_step(&self) -> Step<C> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Step::Closed;
        }
        loop {
            match state.idle.pop() {
                Some(slot) if self.inner.config.expired(slot.created_at) => {
                    self.inner.counters.recycled.fetch_add(1, Ordering::Relaxed);
                }
                Some(slot) => {
                    state.in_use += 1;
                    return Step::Reuse(slot);
                }
                None => break,
            }
        }
        if state.in_use < self.inner.config.max_size {
            state.in_use += 1;
            return Step::Grow;
        }
        let slot = Arc::new(WaiterSlot {
            woken: AtomicBool::new(false),
            waker: Mutex::new(None),
        });
        state.waiters.push_back(Arc::clone(&slot));
        Step::Wait(slot)
    }
}

impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("max_size", &self.inner.config.max_size)
            .field("idle", &stats.idle)
            .field("in_use", &stats.in_use)
            .field("waiting", &stats.waiting)
            .finish()
    }
}

enum Step<C> {
    Reuse(IdleConn<C>),
    Grow,
    Wait(Arc<WaiterSlot>),
    Closed,
}

/// Suspends until a release (or close) hands this waiter a wake token.
struct AcquireWait<C> {
    inner: Arc<PoolInner<C>>,
    slot: Arc<WaiterSlot>,
}

impl<C> Future for AcquireWait<C> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.slot.woken.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }
        {
            let mut waker = self
                .slot
                .waker
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *waker = Some(cx.waker().clone());
        }
        // Re-check after publishing the waker: a wake between the first check
        // and the store would otherwise be lost.
        if self.slot.woken.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl<C> Drop for AcquireWait<C> {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        if let Some(pos) = state
            .waiters
            .iter()
            .position(|s| Arc::ptr_eq(s, &self.slot))
        {
            state.waiters.remove(pos);
        } else if self.slot.woken.load(Ordering::SeqCst) {
            // This waiter consumed a wake token it will never use; pass it on.
            wake_one(&mut state);
        }
    }
}

// ============================================================================
// PooledConnection
// ============================================================================

/// An exclusively held connection, returned to the pool on drop.
pub struct PooledConnection<C: Connection> {
    inner: Arc<PoolInner<C>>,
    slot: Option<IdleConn<C>>,
}

impl<C: Connection> PooledConnection<C> {
    /// Drop the connection instead of returning it to the idle set.
    ///
    /// Use this when the connection's state is no longer trustworthy (for
    /// example a failed rollback). The pool's occupancy count still balances.
    pub fn discard(mut self) {
        if let Some(slot) = self.slot.take() {
            forget_in_use(&self.inner);
            self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
            drop(slot);
        }
    }

    /// Remove the connection from the pool's books and take ownership.
    pub fn detach(mut self) -> C {
        let slot = self
            .slot
            .take()
            .expect("detach called on an already-consumed guard");
        forget_in_use(&self.inner);
        self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
        slot.conn
    }

    /// When the underlying connection was established.
    pub fn created_at(&self) -> Option<Instant> {
        self.slot.as_ref().map(|s| s.created_at)
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self
            .slot
            .as_ref()
            .expect("pooled connection already consumed")
            .conn
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self
            .slot
            .as_mut()
            .expect("pooled connection already consumed")
            .conn
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            release(&self.inner, slot);
        }
    }
}

impl<C: Connection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("held", &self.slot.is_some())
            .finish()
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle connections ready for reuse.
    pub idle: usize,
    /// Connections currently handed out (including reserved growth slots).
    pub in_use: usize,
    /// Acquirers queued behind the capacity cap.
    pub waiting: usize,
    /// Successful acquisitions over the pool's lifetime.
    pub acquires: u64,
    /// Connections returned over the pool's lifetime.
    pub releases: u64,
    /// Connections established through the factory.
    pub created: u64,
    /// Connections retired by age or close.
    pub recycled: u64,
    /// Connections discarded or detached by their holder.
    pub discarded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use txscope_core::{Row, Value};

    #[derive(Debug)]
    struct NullConnection;

    impl Connection for NullConnection {
        fn query(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            async { Outcome::Ok(vec![]) }
        }

        fn query_one(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
            async { Outcome::Ok(None) }
        }

        fn execute(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            async { Outcome::Ok(0) }
        }

        fn insert(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[Value],
        ) -> impl Future<Output = Outcome<i64, Error>> + Send {
            async { Outcome::Ok(0) }
        }

        fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            async { Outcome::Ok(()) }
        }

        fn close(self, _cx: &Cx) -> impl Future<Output = txscope_core::Result<()>> + Send {
            async { Ok(()) }
        }
    }

    fn connect() -> impl Future<Output = Outcome<NullConnection, Error>> {
        async { Outcome::Ok(NullConnection) }
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    #[test]
    fn acquire_grows_then_reuses() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(PoolConfig::new(2));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx, connect).await);
            assert_eq!(pool.stats().created, 1);
            drop(conn);
            assert_eq!(pool.stats().idle, 1);

            let _conn = unwrap_outcome(pool.acquire(&cx, connect).await);
            // Reused, not re-created.
            assert_eq!(pool.stats().created, 1);
            assert_eq!(pool.stats().acquires, 2);
        });
    }

    #[test]
    fn factory_failure_returns_capacity() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool: Pool<NullConnection> = Pool::new(PoolConfig::new(1));

        rt.block_on(async {
            let failed = pool
                .acquire(&cx, || async {
                    Outcome::Err(Error::connection(
                        txscope_core::ConnectionErrorKind::Refused,
                        "nope",
                    ))
                })
                .await;
            assert!(matches!(failed, Outcome::Err(Error::Connection(_))));
            assert_eq!(pool.stats().in_use, 0);

            // Capacity is available again.
            let _conn = unwrap_outcome(pool.acquire(&cx, connect).await);
        });
    }

    #[test]
    fn try_acquire_reports_exhaustion() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(PoolConfig::new(1));

        rt.block_on(async {
            assert!(matches!(
                pool.try_acquire(),
                Err(Error::Pool(p)) if p.kind == PoolErrorKind::Exhausted
            ));

            let held = unwrap_outcome(pool.acquire(&cx, connect).await);
            assert!(pool.try_acquire().is_err());
            drop(held);

            let _idle = pool.try_acquire().expect("idle connection");
        });
    }

    #[test]
    fn discard_and_detach_balance_the_books() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(PoolConfig::new(1));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx, connect).await);
            conn.discard();
            let stats = pool.stats();
            assert_eq!(stats.in_use, 0);
            assert_eq!(stats.idle, 0);
            assert_eq!(stats.discarded, 1);

            let conn = unwrap_outcome(pool.acquire(&cx, connect).await);
            let _owned: NullConnection = conn.detach();
            assert_eq!(pool.stats().in_use, 0);
        });
    }

    #[test]
    fn zero_recycle_age_retires_on_release() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(PoolConfig::new(2).recycle_after(Duration::ZERO));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx, connect).await);
            drop(conn);
            let stats = pool.stats();
            assert_eq!(stats.idle, 0);
            assert_eq!(stats.recycled, 1);
        });
    }

    #[test]
    fn closed_pool_rejects_acquire() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool: Pool<NullConnection> = Pool::new(PoolConfig::new(1));

        pool.close();
        assert!(pool.is_closed());

        rt.block_on(async {
            let outcome = pool.acquire(&cx, connect).await;
            assert!(matches!(
                outcome,
                Outcome::Err(Error::Pool(p)) if p.kind == PoolErrorKind::Closed
            ));
        });
    }

    #[test]
    fn waiter_suspends_until_release() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(PoolConfig::new(1));

        rt.block_on(async {
            let held = unwrap_outcome(pool.acquire(&cx, connect).await);

            let mut second = Box::pin(pool.acquire(&cx, connect));
            let waker = Waker::noop();
            let mut task_cx = Context::from_waker(waker);

            // At capacity: the second acquire parks.
            assert!(second.as_mut().poll(&mut task_cx).is_pending());
            assert_eq!(pool.stats().waiting, 1);

            drop(held);

            // The release handed its slot to the waiter.
            match second.as_mut().poll(&mut task_cx) {
                Poll::Ready(outcome) => {
                    let _conn = unwrap_outcome(outcome);
                }
                Poll::Pending => panic!("waiter not woken by release"),
            }
            assert_eq!(pool.stats().waiting, 0);
        });
    }
}
