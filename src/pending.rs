//! Pending borrowers and the pluggable queues that hold them

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::{PoolError, PoolResult};
use crate::slot::PooledRef;

const WAITING: u8 = 0;
const DELIVERED: u8 = 1;
const CANCELLED: u8 = 2;
const FAILED: u8 = 3;

/// Outcome of attempting to hand a resource to a borrower.
pub(crate) enum Deliver<T: Send + 'static> {
    /// The borrower took it.
    Delivered,

    /// Another transition won the state race first; the handle comes back.
    Raced(PooledRef<T>),

    /// The borrower won the race but its receiving side is gone; the handle
    /// comes back and the borrower counts as served.
    Dead(PooledRef<T>),
}

/// One registered `acquire` request.
///
/// State transitions out of `WAITING` are one-shot and mutually exclusive;
/// whichever party wins the compare-and-swap owns the sink. Stores remove
/// borrowers lazily, so a polled borrower must always be re-checked.
pub(crate) struct Borrower<T: Send + 'static> {
    sink: Mutex<Option<oneshot::Sender<PoolResult<PooledRef<T>>>>>,
    state: AtomicU8,
    home: ThreadId,
    #[allow(dead_code)]
    subscribed_at: Instant,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Borrower<T> {
    pub(crate) fn new(
        sink: oneshot::Sender<PoolResult<PooledRef<T>>>,
        subscribed_at: Instant,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(Some(sink)),
            state: AtomicU8::new(WAITING),
            home: thread::current().id(),
            subscribed_at,
            timer: Mutex::new(None),
        })
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_sink(&self) -> Option<oneshot::Sender<PoolResult<PooledRef<T>>>> {
        self.sink.lock().unwrap().take()
    }

    pub(crate) fn deliver(&self, handle: PooledRef<T>) -> Deliver<T> {
        if !self.transition(DELIVERED) {
            return Deliver::Raced(handle);
        }
        match self.take_sink() {
            Some(sink) => match sink.send(Ok(handle)) {
                Ok(()) => Deliver::Delivered,
                Err(Ok(handle)) => Deliver::Dead(handle),
                Err(Err(_)) => unreachable!("delivery payload was Ok"),
            },
            None => Deliver::Dead(handle),
        }
    }

    /// Fail the borrower (allocator error, shutdown). Returns whether this
    /// call won the transition.
    pub(crate) fn fail(&self, error: PoolError) -> bool {
        if !self.transition(FAILED) {
            return false;
        }
        if let Some(sink) = self.take_sink() {
            let _ = sink.send(Err(error));
        }
        true
    }

    /// Cancel the borrower; `error` is delivered when the cancellation comes
    /// from a deadline timer rather than the caller abandoning the wait.
    pub(crate) fn cancel(&self, error: Option<PoolError>) -> bool {
        if !self.transition(CANCELLED) {
            return false;
        }
        let sink = self.take_sink();
        if let (Some(sink), Some(error)) = (sink, error) {
            let _ = sink.send(Err(error));
        }
        true
    }

    pub(crate) fn set_timer(&self, handle: JoinHandle<()>) {
        *self.timer.lock().unwrap() = Some(handle);
    }

    pub(crate) fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Queue discipline for pending borrowers.
///
/// `offer` may run from any thread; `poll` is only ever invoked by the
/// single logical drain owner, `poll_any` additionally by shutdown.
pub(crate) trait PendingStore<T: Send + 'static>: Send + Sync {
    fn offer(&self, borrower: Arc<Borrower<T>>);

    /// Next borrower to serve, preferring locality where the store supports
    /// it. May return a borrower that already left `WAITING`.
    fn poll(&self) -> Option<Arc<Borrower<T>>>;

    /// Next borrower regardless of locality, for shutdown sweeps.
    fn poll_any(&self) -> Option<Arc<Borrower<T>>> {
        self.poll()
    }
}

/// First come, first served.
pub(crate) struct FifoStore<T: Send + 'static> {
    queue: SegQueue<Arc<Borrower<T>>>,
}

impl<T: Send + 'static> FifoStore<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }
}

impl<T: Send + 'static> PendingStore<T> for FifoStore<T> {
    fn offer(&self, borrower: Arc<Borrower<T>>) {
        self.queue.push(borrower);
    }

    fn poll(&self) -> Option<Arc<Borrower<T>>> {
        self.queue.pop()
    }
}

/// Most recent borrower first. Useful when the newest waiter is the most
/// likely to still be hot (token buckets, per-request lookups).
pub(crate) struct LifoStore<T: Send + 'static> {
    stack: Mutex<Vec<Arc<Borrower<T>>>>,
}

impl<T: Send + 'static> LifoStore<T> {
    pub(crate) fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Send + 'static> PendingStore<T> for LifoStore<T> {
    fn offer(&self, borrower: Arc<Borrower<T>>) {
        self.stack.lock().unwrap().push(borrower);
    }

    fn poll(&self) -> Option<Arc<Borrower<T>>> {
        self.stack.lock().unwrap().pop()
    }
}

/// Prefers borrowers that subscribed on the thread currently draining.
///
/// Every borrower is offered both to its home-thread shard and to a global
/// fallback queue; the delivery compare-and-swap turns whichever copy is
/// popped second into a no-op, so no explicit removal is needed.
pub(crate) struct AffinityStore<T: Send + 'static> {
    shards: DashMap<ThreadId, SegQueue<Arc<Borrower<T>>>>,
    fallback: SegQueue<Arc<Borrower<T>>>,
}

impl<T: Send + 'static> AffinityStore<T> {
    pub(crate) fn new() -> Self {
        Self {
            shards: DashMap::new(),
            fallback: SegQueue::new(),
        }
    }
}

impl<T: Send + 'static> PendingStore<T> for AffinityStore<T> {
    fn offer(&self, borrower: Arc<Borrower<T>>) {
        self.shards
            .entry(borrower.home)
            .or_default()
            .push(borrower.clone());
        self.fallback.push(borrower);
    }

    fn poll(&self) -> Option<Arc<Borrower<T>>> {
        if let Some(shard) = self.shards.get(&thread::current().id()) {
            while let Some(candidate) = shard.pop() {
                if candidate.is_waiting() {
                    return Some(candidate);
                }
            }
        }
        while let Some(candidate) = self.fallback.pop() {
            if candidate.is_waiting() {
                return Some(candidate);
            }
        }
        None
    }

    fn poll_any(&self) -> Option<Arc<Borrower<T>>> {
        // The fallback queue holds every borrower, so sweeping it is enough.
        while let Some(candidate) = self.fallback.pop() {
            if candidate.is_waiting() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn borrower() -> (
        Arc<Borrower<u32>>,
        oneshot::Receiver<PoolResult<PooledRef<u32>>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (Borrower::new(tx, Instant::now()), rx)
    }

    #[test]
    fn transitions_are_one_shot() {
        let (b, _rx) = borrower();
        assert!(b.is_waiting());
        assert!(b.fail(PoolError::Shutdown));
        assert!(!b.fail(PoolError::Shutdown));
        assert!(!b.cancel(None));
        assert!(!b.is_waiting());
    }

    #[test]
    fn cancelled_borrower_drops_sink_silently() {
        let (b, mut rx) = borrower();
        assert!(b.cancel(None));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fifo_store_preserves_order() {
        let store = FifoStore::new();
        let (a, _ra) = borrower();
        let (b, _rb) = borrower();
        store.offer(a.clone());
        store.offer(b.clone());
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &a));
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &b));
        assert!(store.poll().is_none());
    }

    #[test]
    fn lifo_store_reverses_order() {
        let store = LifoStore::new();
        let (a, _ra) = borrower();
        let (b, _rb) = borrower();
        store.offer(a.clone());
        store.offer(b.clone());
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &b));
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &a));
    }

    #[test]
    fn affinity_store_prefers_home_thread() {
        let store = AffinityStore::new();
        let (local, _rl) = borrower();
        store.offer(local.clone());

        // Offered on this thread, so the shard path should find it.
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &local));

        // The fallback copy is now stale and must be skipped once the
        // borrower has been delivered to.
        assert!(local.fail(PoolError::Shutdown));
        assert!(store.poll().is_none());
    }

    #[test]
    fn affinity_poll_any_sweeps_fallback() {
        let store = AffinityStore::new();
        let (a, _ra) = borrower();
        store.offer(a.clone());
        assert!(Arc::ptr_eq(&store.poll_any().unwrap(), &a));
    }
}
