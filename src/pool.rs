//! The pool core: drain loop, lifecycle pipelines, warmup and shutdown

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use tokio::sync::oneshot;

use crate::clock::Clock;
use crate::config::{AcquisitionExecutor, AllocFn, DestroyFn, PendingOrder, PoolConfig, ResetFn};
use crate::errors::{PoolError, PoolResult};
use crate::eviction::EvictionPredicate;
use crate::metrics::PoolMetricsRecorder;
use crate::pending::{AffinityStore, Borrower, Deliver, FifoStore, LifoStore, PendingStore};
use crate::slot::{IdleSlot, Parts, PooledRef, SlotMeta};
use crate::strategy::AllocationStrategy;

/// Outcome of one matching round.
///
/// `Retry` re-runs the round without touching the work-in-progress counter,
/// mirroring how a retried round must re-read all shared state before
/// deciding anything.
enum Round {
    Retry,
    Settled,
}

pub(crate) struct PoolInner<T: Send + 'static> {
    me: Weak<PoolInner<T>>,
    allocator: AllocFn<T>,
    release_handler: ResetFn<T>,
    destroy_handler: DestroyFn<T>,
    eviction: EvictionPredicate<T>,
    strategy: Arc<dyn AllocationStrategy>,
    executor: Option<Arc<dyn AcquisitionExecutor>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn PoolMetricsRecorder>,
    runtime: Option<tokio::runtime::Handle>,
    idle: SegQueue<IdleSlot<T>>,
    pending: Box<dyn PendingStore<T>>,
    pending_count: AtomicUsize,
    acquired: AtomicUsize,
    wip: AtomicUsize,
    disposed: AtomicBool,
}

impl<T: Send + 'static> PoolInner<T> {
    /// Run `future` on the pool's runtime. Falls back to the ambient
    /// runtime when the pool was built outside of one.
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        let handle = self
            .runtime
            .clone()
            .or_else(|| tokio::runtime::Handle::try_current().ok());
        match handle {
            Some(handle) => {
                handle.spawn(future);
            }
            None => tracing::warn!("no tokio runtime available, pool task dropped"),
        }
    }

    /// Schedule a matching pass. Whoever bumps the counter from zero runs
    /// the loop; everyone else has their work covered by the re-read at the
    /// top of each round.
    pub(crate) fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.drain_loop();
        }
    }

    fn drain_loop(&self) {
        let mut missed = 1;
        loop {
            if let Round::Retry = self.drain_round() {
                continue;
            }
            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                break;
            }
            missed = remaining;
        }
    }

    fn drain_round(&self) -> Round {
        let Some(pool) = self.me.upgrade() else {
            return Round::Settled;
        };
        if self.disposed.load(Ordering::Acquire) {
            // shutdown sweeps both stores; in-flight releases destroy
            // themselves
            return Round::Settled;
        }

        let available = self.idle.len();
        let pending = self.pending_count.load(Ordering::Acquire);
        let estimated = self.strategy.estimate();

        if available == 0 {
            if pending > 0 && estimated > 0 {
                let Some(borrower) = self.pending.poll() else {
                    return Round::Retry;
                };
                // Claim the acquisition before the allocator runs so a
                // concurrent round cannot start a second allocation for the
                // same pending slot.
                self.acquired.fetch_add(1, Ordering::AcqRel);
                let granted = self.strategy.try_get(1);
                if granted == 0 || !borrower.is_waiting() {
                    self.acquired.fetch_sub(1, Ordering::AcqRel);
                    if granted > 0 {
                        self.strategy.return_permits(granted);
                    }
                    if borrower.is_waiting() {
                        // no capacity right now; keep the borrower queued
                        self.pending.offer(borrower);
                    }
                    return Round::Retry;
                }
                borrower.stop_timer();
                let started = self.clock.now();
                let allocation = (self.allocator)();
                let task_pool = Arc::clone(&pool);
                self.spawn(async move {
                    match allocation.await {
                        Ok(value) => {
                            let now = task_pool.clock.now();
                            task_pool
                                .metrics
                                .record_allocation_success_latency(now.saturating_duration_since(started));
                            task_pool.deliver(IdleSlot::new(value, now), borrower);
                        }
                        Err(cause) => {
                            task_pool.metrics.record_allocation_failure_latency(
                                task_pool.clock.now().saturating_duration_since(started),
                            );
                            task_pool.acquired.fetch_sub(1, Ordering::AcqRel);
                            task_pool.strategy.return_permits(1);
                            if borrower.fail(PoolError::Allocation(cause)) {
                                task_pool.pending_count.fetch_sub(1, Ordering::AcqRel);
                            }
                            task_pool.drain();
                        }
                    }
                });

                // The strategy may grant extras to reach its minimum; they
                // warm the idle store in the background.
                for extra in 1..granted {
                    tracing::debug!(extra, total = granted - 1, "warming up extra resource");
                    let warm_start = self.clock.now();
                    let warm = (self.allocator)();
                    let warm_pool = Arc::clone(&pool);
                    self.spawn(async move {
                        match warm.await {
                            Ok(value) => {
                                let now = warm_pool.clock.now();
                                warm_pool.metrics.record_allocation_success_latency(
                                    now.saturating_duration_since(warm_start),
                                );
                                warm_pool.idle.push(IdleSlot::new(value, now));
                                warm_pool.drain();
                            }
                            Err(cause) => {
                                warm_pool.metrics.record_allocation_failure_latency(
                                    warm_pool.clock.now().saturating_duration_since(warm_start),
                                );
                                warm_pool.strategy.return_permits(1);
                                tracing::debug!(error = %cause, "extra warmup allocation failed");
                            }
                        }
                    });
                }
            }
        } else if pending > 0 {
            let Some(slot) = self.idle.pop() else {
                return Round::Retry;
            };
            let now = self.clock.now();
            // Second chance: an idle resource may have gone stale since its
            // release-time check.
            if self.should_evict(&slot.value, &slot.meta, now) {
                self.spawn(Arc::clone(&pool).destroy_pipeline(slot.value));
                return Round::Retry;
            }
            let Some(borrower) = self.pending.poll() else {
                self.give_back(slot);
                return Round::Retry;
            };
            borrower.stop_timer();
            self.acquired.fetch_add(1, Ordering::AcqRel);
            self.metrics
                .record_idle_time(now.saturating_duration_since(slot.meta.last_release));
            self.deliver(slot, borrower);
        }

        Round::Settled
    }

    /// Put a slot back into the idle store, guarding against the window
    /// where shutdown's idle sweep has already passed.
    fn give_back(&self, slot: IdleSlot<T>) {
        self.idle.push(slot);
        if self.disposed.load(Ordering::Acquire) {
            if let Some(pool) = self.me.upgrade() {
                if let Some(slot) = self.idle.pop() {
                    self.spawn(Arc::clone(&pool).destroy_pipeline(slot.value));
                }
            }
        } else {
            self.drain();
        }
    }

    fn should_evict(&self, value: &T, meta: &SlotMeta, now: Instant) -> bool {
        let view = meta.view(now);
        match catch_unwind(AssertUnwindSafe(|| (self.eviction)(value, &view))) {
            Ok(unfit) => unfit,
            Err(_) => {
                tracing::warn!("eviction predicate panicked, destroying resource");
                true
            }
        }
    }

    /// Hand `slot` to `borrower`, hopping through the acquisition executor
    /// when one is configured. Assumes the acquisition is already counted.
    fn deliver(&self, slot: IdleSlot<T>, borrower: Arc<Borrower<T>>) {
        match &self.executor {
            None => self.hand_off(slot, borrower),
            Some(executor) => {
                let Some(pool) = self.me.upgrade() else {
                    return;
                };
                executor.schedule(Box::new(move || pool.hand_off(slot, borrower)));
            }
        }
    }

    fn hand_off(&self, mut slot: IdleSlot<T>, borrower: Arc<Borrower<T>>) {
        borrower.stop_timer();
        slot.meta.acquire_count += 1;
        let handle = PooledRef::new(slot, self.me.clone());
        match borrower.deliver(handle) {
            Deliver::Delivered => {
                self.pending_count.fetch_sub(1, Ordering::AcqRel);
            }
            Deliver::Raced(handle) => {
                // The borrower was cancelled under us; the slot goes back
                // and the next round finds another taker.
                self.acquired.fetch_sub(1, Ordering::AcqRel);
                self.give_back(handle.into_idle());
            }
            Deliver::Dead(handle) => {
                self.pending_count.fetch_sub(1, Ordering::AcqRel);
                self.acquired.fetch_sub(1, Ordering::AcqRel);
                self.give_back(handle.into_idle());
            }
        }
    }

    /// Release path: reset, vet, then recycle or destroy.
    pub(crate) async fn release_pipeline(self: Arc<Self>, parts: Parts<T>) -> PoolResult<()> {
        // The acquisition ends here, whatever happens downstream.
        self.acquired.fetch_sub(1, Ordering::AcqRel);
        let Parts { value, mut meta } = parts;

        if self.disposed.load(Ordering::Acquire) {
            Arc::clone(&self).destroy_pipeline(value).await;
            return Ok(());
        }

        let started = self.clock.now();
        match (self.release_handler)(value).await {
            Ok(value) => {
                self.metrics
                    .record_reset_latency(self.clock.now().saturating_duration_since(started));
                let now = self.clock.now();
                meta.last_release = now;
                if self.disposed.load(Ordering::Acquire) || self.should_evict(&value, &meta, now) {
                    Arc::clone(&self).destroy_pipeline(value).await;
                } else {
                    self.idle.push(IdleSlot { value, meta });
                    if self.disposed.load(Ordering::Acquire) {
                        // lost the race against shutdown's idle sweep
                        if let Some(slot) = self.idle.pop() {
                            Arc::clone(&self).destroy_pipeline(slot.value).await;
                        }
                    } else {
                        self.metrics.record_recycled();
                        self.drain();
                    }
                }
                Ok(())
            }
            Err((value, cause)) => {
                self.metrics
                    .record_reset_latency(self.clock.now().saturating_duration_since(started));
                Arc::clone(&self).destroy_pipeline(value).await;
                Err(PoolError::ReleaseHandler(cause))
            }
        }
    }

    pub(crate) async fn invalidate_pipeline(self: Arc<Self>, value: T) {
        self.acquired.fetch_sub(1, Ordering::AcqRel);
        self.destroy_pipeline(value).await;
    }

    /// Terminal path: the resource is gone no matter what the handler says.
    pub(crate) async fn destroy_pipeline(self: Arc<Self>, value: T) {
        let started = self.clock.now();
        if let Err(cause) = (self.destroy_handler)(value).await {
            tracing::warn!(error = %cause, "destroy handler failed, resource is gone regardless");
        }
        self.metrics
            .record_destroy_latency(self.clock.now().saturating_duration_since(started));
        self.strategy.return_permits(1);
        self.drain();
    }

    /// A live handle was dropped without an explicit release or invalidate.
    pub(crate) fn reclaim_dropped(self: Arc<Self>, parts: Parts<T>) {
        let handle = self
            .runtime
            .clone()
            .or_else(|| tokio::runtime::Handle::try_current().ok());
        match handle {
            Some(handle) => {
                let pool = Arc::clone(&self);
                handle.spawn(async move {
                    let _ = pool.release_pipeline(parts).await;
                });
            }
            None => {
                // Nowhere to run the pipelines; settle the permit books and
                // let the resource drop in place.
                self.acquired.fetch_sub(1, Ordering::AcqRel);
                self.strategy.return_permits(1);
                tracing::warn!("pooled resource dropped outside a runtime, destroy handler skipped");
            }
        }
    }
}

/// Asynchronous object pool.
///
/// Resources are created by the configured allocator, lent out through
/// [`acquire`](Pool::acquire), and returned either explicitly via
/// [`PooledRef::release`] / [`PooledRef::invalidate`] or implicitly when a
/// handle is dropped.
///
/// All matching between idle resources and waiting borrowers happens in a
/// non-blocking drain loop serialised by a work-in-progress counter: any
/// number of threads can feed the pool concurrently, but at most one runs
/// the matching logic at a time, and none ever blocks in it. A resource can
/// therefore be handed off on the allocator's thread, the releaser's
/// thread, or the subscriber's thread; configure an
/// [`AcquisitionExecutor`] for a deterministic hand-off thread.
///
/// Cloning the pool is cheap and all clones share the same state.
pub struct Pool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Pool({:p})", self.inner))
    }
}

impl<T: Send + 'static> Pool<T> {
    pub(crate) fn assemble(config: PoolConfig<T>) -> Self {
        let pending: Box<dyn PendingStore<T>> = match config.order {
            PendingOrder::Fifo => Box::new(FifoStore::new()),
            PendingOrder::Lifo => Box::new(LifoStore::new()),
            PendingOrder::Affinity => Box::new(AffinityStore::new()),
        };
        let inner = Arc::new_cyclic(|me| PoolInner {
            me: me.clone(),
            allocator: config.allocator,
            release_handler: config.release_handler,
            destroy_handler: config.destroy_handler,
            eviction: config.eviction,
            strategy: config.strategy,
            executor: config.executor,
            clock: config.clock,
            metrics: config.metrics,
            runtime: tokio::runtime::Handle::try_current().ok(),
            idle: SegQueue::new(),
            pending,
            pending_count: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            wip: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Borrow a resource, waiting as long as it takes.
    pub async fn acquire(&self) -> PoolResult<PooledRef<T>> {
        self.acquire_inner(Duration::ZERO).await
    }

    /// Borrow a resource, failing with [`PoolError::AcquireTimeout`] if none
    /// can be delivered within `timeout`.
    ///
    /// A zero `timeout` means wait indefinitely, same as
    /// [`acquire`](Pool::acquire).
    pub async fn acquire_timeout(&self, timeout: Duration) -> PoolResult<PooledRef<T>> {
        self.acquire_inner(timeout).await
    }

    async fn acquire_inner(&self, timeout: Duration) -> PoolResult<PooledRef<T>> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        let borrower = Borrower::new(tx, inner.clock.now());
        inner.pending.offer(Arc::clone(&borrower));
        inner.pending_count.fetch_add(1, Ordering::AcqRel);

        if inner.disposed.load(Ordering::Acquire) {
            // raced with shutdown after registering
            if borrower.fail(PoolError::Shutdown) {
                inner.pending_count.fetch_sub(1, Ordering::AcqRel);
            }
        } else {
            if !timeout.is_zero() {
                let timed = Arc::clone(&borrower);
                let pool = Arc::downgrade(inner);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if timed.cancel(Some(PoolError::AcquireTimeout(timeout))) {
                        if let Some(pool) = pool.upgrade() {
                            pool.pending_count.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                });
                borrower.set_timer(timer);
            }
            inner.drain();
        }

        let guard = CancelGuard {
            borrower: Arc::clone(&borrower),
            pool: Arc::clone(inner),
            armed: true,
        };
        let outcome = rx.await;
        guard.disarm();
        match outcome {
            Ok(result) => result,
            Err(_) => Err(PoolError::InvalidState(
                "borrower sink closed without a terminal outcome",
            )),
        }
    }

    /// Pre-allocate resources up to the strategy's minimum, concurrently.
    ///
    /// Returns how many allocations succeeded; partial failure is not
    /// fatal.
    pub async fn warmup(&self) -> PoolResult<usize> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        let desired = inner.strategy.min();
        if desired == 0 {
            return Ok(0);
        }
        let granted = inner.strategy.try_get(desired);
        let mut tasks = Vec::with_capacity(granted);
        for _ in 0..granted {
            let pool = Arc::clone(inner);
            let allocation = (inner.allocator)();
            tasks.push(tokio::spawn(async move {
                let started = pool.clock.now();
                match allocation.await {
                    Ok(value) => {
                        let now = pool.clock.now();
                        pool.metrics
                            .record_allocation_success_latency(now.saturating_duration_since(started));
                        pool.idle.push(IdleSlot::new(value, now));
                        pool.drain();
                        true
                    }
                    Err(cause) => {
                        pool.metrics.record_allocation_failure_latency(
                            pool.clock.now().saturating_duration_since(started),
                        );
                        pool.strategy.return_permits(1);
                        tracing::debug!(error = %cause, "warmup allocation failed");
                        false
                    }
                }
            }));
        }
        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap_or(false) {
                successes += 1;
            }
        }
        Ok(successes)
    }

    /// Shut the pool down.
    ///
    /// Every waiting borrower fails with [`PoolError::Shutdown`], every idle
    /// resource is destroyed exactly once, and later `acquire` calls are
    /// rejected. Resources currently lent out stay valid; they are destroyed
    /// when eventually released. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        while let Some(borrower) = inner.pending.poll_any() {
            if borrower.fail(PoolError::Shutdown) {
                inner.pending_count.fetch_sub(1, Ordering::AcqRel);
                borrower.stop_timer();
            }
        }
        let mut tasks = Vec::new();
        while let Some(slot) = inner.idle.pop() {
            let pool = Arc::clone(inner);
            tasks.push(tokio::spawn(async move {
                pool.destroy_pipeline(slot.value).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Number of resources currently idle in the pool.
    pub fn idle_size(&self) -> usize {
        self.inner.idle.len()
    }

    /// Number of resources currently lent to borrowers.
    pub fn acquired_size(&self) -> usize {
        self.inner.acquired.load(Ordering::Acquire)
    }

    /// Number of borrowers waiting for a resource.
    pub fn pending_size(&self) -> usize {
        self.inner.pending_count.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`](Pool::shutdown) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

/// Cancels the borrower when an `acquire` future is dropped mid-wait.
struct CancelGuard<T: Send + 'static> {
    borrower: Arc<Borrower<T>>,
    pool: Arc<PoolInner<T>>,
    armed: bool,
}

impl<T: Send + 'static> CancelGuard<T> {
    fn disarm(mut self) {
        self.armed = false;
        self.borrower.stop_timer();
    }
}

impl<T: Send + 'static> Drop for CancelGuard<T> {
    fn drop(&mut self) {
        if self.armed && self.borrower.cancel(None) {
            self.pool.pending_count.fetch_sub(1, Ordering::AcqRel);
            self.borrower.stop_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PoolBuilder;
    use crate::errors::BoxError;
    use crate::metrics::InMemoryRecorder;
    use crate::strategy::Bounded;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        allocated: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                allocated: Arc::new(AtomicUsize::new(0)),
                destroyed: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Allocator yielding 0, 1, 2, ... in invocation order.
        fn builder(&self) -> PoolBuilder<usize> {
            let counter = Arc::clone(&self.allocated);
            let destroyed = Arc::clone(&self.destroyed);
            PoolBuilder::new(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, BoxError>(n) }
            })
            .destroy_handler(move |value: usize| {
                let destroyed = Arc::clone(&destroyed);
                async move {
                    drop(value);
                    destroyed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        }

        fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }

        fn allocated(&self) -> usize {
            self.allocated.load(Ordering::SeqCst)
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s1_fifo_delivery_with_bounded_two() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(2).build();

        let a1 = pool.acquire().await.unwrap();
        let a2 = pool.acquire().await.unwrap();
        assert_eq!(*a1, 0);
        assert_eq!(*a2, 1);

        let p3 = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };
        wait_until(|| pool.pending_size() == 1).await;
        let p4 = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };
        wait_until(|| pool.pending_size() == 2).await;

        a1.release().await.unwrap();
        let a3 = p3.await.unwrap();
        assert_eq!(*a3, 0, "first pending borrower reuses the released resource");

        a2.invalidate().await;
        let a4 = p4.await.unwrap();
        assert_eq!(*a4, 2, "invalidation frees a permit for a fresh allocation");

        assert_eq!(pool.acquired_size(), 2);
        assert_eq!(pool.idle_size(), 0);
        assert_eq!(fx.destroyed(), 1);
        drop(a3);
        drop(a4);
    }

    #[tokio::test(start_paused = true)]
    async fn s2_timeout_fails_waiting_borrower() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(1).build();

        let a1 = pool.acquire().await.unwrap();
        let outcome = pool.acquire_timeout(Duration::from_millis(50)).await;
        assert!(matches!(outcome, Err(PoolError::AcquireTimeout(_))));

        a1.release().await.unwrap();
        assert_eq!(pool.idle_size(), 1);
        assert_eq!(pool.acquired_size(), 0);
    }

    #[tokio::test]
    async fn s3_second_chance_eviction_on_acquire() {
        let fx = Fixture::new();
        let clock = Arc::new(ManualClock::new());
        let pool = fx
            .builder()
            .evict_idle(Duration::from_millis(100))
            .clock(clock.clone())
            .build();

        let r1 = pool.acquire().await.unwrap();
        assert_eq!(*r1, 0);
        r1.release().await.unwrap();
        assert_eq!(pool.idle_size(), 1);

        clock.advance(Duration::from_millis(150));
        let r2 = pool.acquire().await.unwrap();
        assert_eq!(*r2, 1, "stale resource replaced by a fresh allocation");
        wait_until(|| fx.destroyed() == 1).await;
        assert_eq!(fx.allocated(), 2);
        drop(r2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s4_shutdown_fails_pending_and_destroys_on_release() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(1).build();

        let a1 = pool.acquire().await.unwrap();
        let p2 = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        wait_until(|| pool.pending_size() == 1).await;
        let p3 = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        wait_until(|| pool.pending_size() == 2).await;

        pool.shutdown().await;
        assert!(matches!(p2.await.unwrap(), Err(PoolError::Shutdown)));
        assert!(matches!(p3.await.unwrap(), Err(PoolError::Shutdown)));

        a1.release().await.unwrap();
        assert_eq!(fx.destroyed(), 1, "released resource is destroyed, not recycled");
        assert_eq!(pool.acquired_size(), 0);
        assert_eq!(pool.idle_size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn s5_release_handler_error_destroys_and_reallocates() {
        let fx = Fixture::new();
        let pool = fx
            .builder()
            .max_size(1)
            .release_handler(|value: usize| async move {
                Err((value, BoxError::from("reset failed")))
            })
            .build();

        let a1 = pool.acquire().await.unwrap();
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };
        wait_until(|| pool.pending_size() == 1).await;

        let outcome = a1.release().await;
        assert!(matches!(outcome, Err(PoolError::ReleaseHandler(_))));
        assert_eq!(fx.destroyed(), 1);

        let b = pending.await.unwrap();
        assert_eq!(*b, 1, "pending borrower is served by a fresh allocation");
        assert_eq!(pool.acquired_size(), 1);
        drop(b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn s6_concurrent_release_storm_quiesces() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(64).build();

        let mut held = Vec::new();
        for _ in 0..64 {
            held.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.acquired_size(), 64);

        let mut releases = Vec::new();
        for handle in held {
            releases.push(tokio::spawn(async move {
                handle.release().await.unwrap();
            }));
        }
        for release in releases {
            release.await.unwrap();
        }

        wait_until(|| pool.idle_size() == 64 && pool.acquired_size() == 0).await;
        wait_until(|| pool.inner.wip.load(Ordering::Acquire) == 0).await;
        assert_eq!(pool.pending_size(), 0);
    }

    #[tokio::test]
    async fn round_trip_restores_observable_state() {
        let fx = Fixture::new();
        let strategy = Arc::new(Bounded::new(2));
        let pool = fx
            .builder()
            .shared_allocation_strategy(strategy.clone())
            .build();

        // Establish a baseline with one recycled resource.
        pool.acquire().await.unwrap().release().await.unwrap();
        assert_eq!((pool.idle_size(), pool.acquired_size(), strategy.granted()), (1, 0, 1));

        pool.acquire().await.unwrap().release().await.unwrap();
        assert_eq!((pool.idle_size(), pool.acquired_size(), strategy.granted()), (1, 0, 1));
        assert_eq!(fx.destroyed(), 0);
    }

    #[tokio::test]
    async fn warmup_then_shutdown_destroys_each_once() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size_with_min(8, 3).build();

        assert_eq!(pool.warmup().await.unwrap(), 3);
        assert_eq!(pool.idle_size(), 3);

        pool.shutdown().await;
        assert_eq!(fx.destroyed(), 3);
        assert_eq!(pool.idle_size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_acquire_below_minimum_warms_extras() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size_with_min(4, 3).build();

        let r = pool.acquire().await.unwrap();
        wait_until(|| pool.idle_size() == 2).await;
        assert_eq!(fx.allocated(), 3, "one delivery plus two warm extras");
        assert_eq!(pool.acquired_size(), 1);
        drop(r);
    }

    #[tokio::test]
    async fn warmup_without_minimum_is_a_no_op() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(4).build();
        assert_eq!(pool.warmup().await.unwrap(), 0);
        assert_eq!(fx.allocated(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bounded_overflow_waits_then_serves_on_release() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(2).build();

        let a1 = pool.acquire().await.unwrap();
        let a2 = pool.acquire().await.unwrap();
        let third = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };
        wait_until(|| pool.pending_size() == 1).await;
        assert!(!third.is_finished());
        assert_eq!(pool.acquired_size(), 2);

        a1.release().await.unwrap();
        let a3 = third.await.unwrap();
        assert_eq!(*a3, 0);
        drop(a2);
        drop(a3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_waits_indefinitely() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(1).build();

        let a1 = pool.acquire().await.unwrap();
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_timeout(Duration::ZERO).await.unwrap() })
        };
        wait_until(|| pool.pending_size() == 1).await;

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!waiting.is_finished(), "zero timeout never deadlines the wait");

        a1.release().await.unwrap();
        let b = waiting.await.unwrap();
        assert_eq!(*b, 0);
        drop(b);
    }

    #[tokio::test]
    async fn always_evict_churns_every_release() {
        let fx = Fixture::new();
        let pool = fx
            .builder()
            .eviction_predicate(|_: &usize, _| true)
            .build();

        for round in 0..3 {
            let r = pool.acquire().await.unwrap();
            assert_eq!(*r, round, "every acquire allocates fresh");
            r.release().await.unwrap();
            assert_eq!(fx.destroyed(), round + 1, "every release destroys");
        }
        assert_eq!(pool.idle_size(), 0);
    }

    #[tokio::test]
    async fn allocation_error_returns_permit_and_surfaces_once() {
        let failing = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&failing);
        let strategy = Arc::new(Bounded::new(1));
        let pool = PoolBuilder::new(move || {
            let fail = flag.load(Ordering::SeqCst);
            async move {
                if fail {
                    Err(BoxError::from("connect refused"))
                } else {
                    Ok(7usize)
                }
            }
        })
        .shared_allocation_strategy(strategy.clone())
        .build();

        let outcome = pool.acquire().await;
        assert!(matches!(outcome, Err(PoolError::Allocation(_))));
        assert_eq!(strategy.granted(), 0, "failed allocation returns its permit");
        assert_eq!(pool.acquired_size(), 0);

        failing.store(false, Ordering::SeqCst);
        let r = pool.acquire().await.unwrap();
        assert_eq!(*r, 7);
        drop(r);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_acquire_does_not_leak() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(1).build();

        let a1 = pool.acquire().await.unwrap();
        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        wait_until(|| pool.pending_size() == 1).await;

        abandoned.abort();
        wait_until(|| pool.pending_size() == 0).await;

        a1.release().await.unwrap();
        wait_until(|| pool.idle_size() == 1).await;
        assert_eq!(pool.acquired_size(), 0);
        assert_eq!(fx.destroyed(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dropping_a_handle_recycles_in_the_background() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(1).build();

        let r = pool.acquire().await.unwrap();
        drop(r);
        wait_until(|| pool.idle_size() == 1 && pool.acquired_size() == 0).await;
        assert_eq!(fx.destroyed(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_acquires() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(1).build();

        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool.is_disposed());
        assert!(matches!(pool.acquire().await, Err(PoolError::Shutdown)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lifo_serves_newest_waiter_first() {
        let fx = Fixture::new();
        let pool = fx
            .builder()
            .max_size(1)
            .pending_order(PendingOrder::Lifo)
            .build();

        let a1 = pool.acquire().await.unwrap();
        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };
        wait_until(|| pool.pending_size() == 1).await;
        let second = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };
        wait_until(|| pool.pending_size() == 2).await;

        a1.release().await.unwrap();
        let newest = second.await.unwrap();
        assert!(!first.is_finished(), "older waiter keeps waiting under LIFO");

        newest.release().await.unwrap();
        let oldest = first.await.unwrap();
        drop(oldest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn affinity_order_still_serves_cross_thread_waiters() {
        let fx = Fixture::new();
        let pool = fx
            .builder()
            .max_size(1)
            .pending_order(PendingOrder::Affinity)
            .build();

        let a1 = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };
        wait_until(|| pool.pending_size() == 1).await;

        a1.release().await.unwrap();
        let b = waiter.await.unwrap();
        assert_eq!(*b, 0);
        drop(b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acquisition_executor_hops_but_delivers() {
        let fx = Fixture::new();
        let pool = fx
            .builder()
            .max_size(1)
            .acquisition_executor(crate::config::TokioExecutor)
            .build();

        let r = pool.acquire().await.unwrap();
        assert_eq!(*r, 0);
        r.release().await.unwrap();
        wait_until(|| pool.idle_size() == 1).await;

        let again = pool.acquire().await.unwrap();
        assert_eq!(*again, 0);
        drop(again);
    }

    #[tokio::test]
    async fn metrics_cover_the_lifecycle() {
        let fx = Fixture::new();
        let recorder = Arc::new(InMemoryRecorder::new());
        let pool = fx.builder().max_size(2).metrics(recorder.clone()).build();

        let r = pool.acquire().await.unwrap();
        r.release().await.unwrap();
        let again = pool.acquire().await.unwrap();
        again.invalidate().await;

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.allocation_successes, 1);
        assert_eq!(snapshot.resets, 1);
        assert_eq!(snapshot.recycled, 1);
        assert_eq!(snapshot.destroys, 1);
    }

    #[tokio::test]
    async fn panicking_predicate_counts_as_eviction() {
        let fx = Fixture::new();
        let pool = fx
            .builder()
            .eviction_predicate(|_: &usize, _| panic!("broken predicate"))
            .build();

        let r = pool.acquire().await.unwrap();
        r.release().await.unwrap();
        assert_eq!(fx.destroyed(), 1);
        assert_eq!(pool.idle_size(), 0);
    }

    #[tokio::test]
    async fn acquire_count_survives_recycling() {
        let fx = Fixture::new();
        let pool = fx.builder().max_size(1).build();

        let first = pool.acquire().await.unwrap();
        assert_eq!(first.acquire_count(), 1);
        first.release().await.unwrap();

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.acquire_count(), 2);
        drop(second);
    }
}
