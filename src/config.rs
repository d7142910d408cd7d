//! Pool configuration and construction

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::errors::BoxError;
use crate::eviction::{self, EvictionPredicate};
use crate::metrics::{NoOpRecorder, PoolMetricsRecorder};
use crate::pool::Pool;
use crate::slot::RefMetadata;
use crate::strategy::{AllocationStrategy, Bounded, Unbounded};

/// Boxed future returned by the asynchronous handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) type AllocFn<T> = Arc<dyn Fn() -> BoxFuture<Result<T, BoxError>> + Send + Sync>;
pub(crate) type ResetFn<T> = Arc<dyn Fn(T) -> BoxFuture<Result<T, (T, BoxError)>> + Send + Sync>;
pub(crate) type DestroyFn<T> = Arc<dyn Fn(T) -> BoxFuture<Result<(), BoxError>> + Send + Sync>;

/// Ordering discipline for borrowers waiting on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingOrder {
    /// First come, first served. The default.
    #[default]
    Fifo,

    /// Most recent borrower first.
    Lifo,

    /// Prefer borrowers that subscribed on the thread a resource is being
    /// released or drained on, falling back to global FIFO order.
    Affinity,
}

/// Delivers acquired resources on a caller-chosen executor instead of
/// whatever thread the drain loop happens to run on.
///
/// Opting in buys a deterministic hand-off thread at the cost of an extra
/// hop per delivery.
pub trait AcquisitionExecutor: Send + Sync + 'static {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>);
}

/// Delivery on a freshly spawned tokio task.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

impl AcquisitionExecutor for TokioExecutor {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move { task() });
    }
}

/// Everything [`Pool::assemble`] needs, collected by the builder.
pub(crate) struct PoolConfig<T: Send + 'static> {
    pub(crate) allocator: AllocFn<T>,
    pub(crate) release_handler: ResetFn<T>,
    pub(crate) destroy_handler: DestroyFn<T>,
    pub(crate) eviction: EvictionPredicate<T>,
    pub(crate) strategy: Arc<dyn AllocationStrategy>,
    pub(crate) order: PendingOrder,
    pub(crate) executor: Option<Arc<dyn AcquisitionExecutor>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<dyn PoolMetricsRecorder>,
}

/// Builder for [`Pool`].
///
/// Starts from an asynchronous allocator and defaults that mirror a plain
/// pass-through pool: unbounded growth, no-op release and destroy handlers,
/// never-evict predicate, inline delivery, no-op metrics, system clock.
///
/// # Examples
///
/// ```
/// use drainpool::{BoxError, PendingOrder, PoolBuilder};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = PoolBuilder::new(|| async { Ok::<_, BoxError>(String::new()) })
///     .max_size(8)
///     .evict_idle(Duration::from_secs(60))
///     .pending_order(PendingOrder::Fifo)
///     .build();
///
/// let s = pool.acquire().await.unwrap();
/// assert!(s.is_empty());
/// # drop(s);
/// # pool.shutdown().await;
/// # }
/// ```
pub struct PoolBuilder<T: Send + 'static> {
    allocator: AllocFn<T>,
    release_handler: ResetFn<T>,
    destroy_handler: DestroyFn<T>,
    eviction: EvictionPredicate<T>,
    strategy: Arc<dyn AllocationStrategy>,
    order: PendingOrder,
    executor: Option<Arc<dyn AcquisitionExecutor>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn PoolMetricsRecorder>,
}

impl<T: Send + 'static> PoolBuilder<T> {
    /// Start building a pool around `allocator`.
    ///
    /// The allocator must not block its thread; it is invoked once per
    /// resource and either yields a value or fails. The pool never retries
    /// a failed allocation on its own.
    pub fn new<F, Fut>(allocator: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self {
            allocator: Arc::new(move || -> BoxFuture<Result<T, BoxError>> {
                Box::pin(allocator())
            }),
            release_handler: Arc::new(|value: T| -> BoxFuture<Result<T, (T, BoxError)>> {
                Box::pin(async move { Ok(value) })
            }),
            destroy_handler: Arc::new(|value: T| -> BoxFuture<Result<(), BoxError>> {
                Box::pin(async move {
                    drop(value);
                    Ok(())
                })
            }),
            eviction: eviction::never(),
            strategy: Arc::new(Unbounded),
            order: PendingOrder::default(),
            executor: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoOpRecorder),
        }
    }

    /// Cap the pool at `max` live resources.
    pub fn max_size(self, max: usize) -> Self {
        self.allocation_strategy(Bounded::new(max))
    }

    /// Cap the pool at `max` live resources and let [`Pool::warmup`]
    /// pre-allocate up to `min`.
    pub fn max_size_with_min(self, max: usize, min: usize) -> Self {
        self.allocation_strategy(Bounded::with_min(max, min))
    }

    /// Let the pool grow without limit. The default.
    pub fn unbounded(self) -> Self {
        self.allocation_strategy(Unbounded)
    }

    /// Gate resource creation with a custom strategy.
    pub fn allocation_strategy<S: AllocationStrategy>(mut self, strategy: S) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Same as [`allocation_strategy`](Self::allocation_strategy) but keeps
    /// the caller's handle to the strategy alive, e.g. to observe
    /// [`Bounded::granted`] from tests.
    pub fn shared_allocation_strategy(mut self, strategy: Arc<dyn AllocationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Reset a resource before it goes back to idle.
    ///
    /// The handler receives the resource by value and returns it once reset.
    /// Returning `Err((resource, cause))` destroys the resource and surfaces
    /// the cause to whoever called `release`.
    pub fn release_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, (T, BoxError)>> + Send + 'static,
    {
        self.release_handler = Arc::new(move |value: T| -> BoxFuture<Result<T, (T, BoxError)>> {
            Box::pin(handler(value))
        });
        self
    }

    /// Tear a resource down once the pool is done with it.
    ///
    /// Handler errors are logged and otherwise swallowed; destruction is
    /// considered irreversible regardless of the handler outcome.
    pub fn destroy_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.destroy_handler = Arc::new(move |value: T| -> BoxFuture<Result<(), BoxError>> {
            Box::pin(handler(value))
        });
        self
    }

    /// Decide at release and at acquire time whether a resource is still
    /// fit for the pool. `true` means destroy.
    pub fn eviction_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T, &RefMetadata) -> bool + Send + Sync + 'static,
    {
        self.eviction = Arc::new(predicate);
        self
    }

    /// Shorthand for [`eviction::idle_more_than`].
    pub fn evict_idle(mut self, ttl: Duration) -> Self {
        self.eviction = eviction::idle_more_than(ttl);
        self
    }

    /// Queue discipline for waiting borrowers.
    pub fn pending_order(mut self, order: PendingOrder) -> Self {
        self.order = order;
        self
    }

    /// Deliver acquired resources through `executor` instead of inline.
    pub fn acquisition_executor<E: AcquisitionExecutor>(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Override the time source. Mostly useful with
    /// [`ManualClock`](crate::ManualClock) in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record pool instrumentation events with `recorder`.
    pub fn metrics(mut self, recorder: Arc<dyn PoolMetricsRecorder>) -> Self {
        self.metrics = recorder;
        self
    }

    /// Build the pool.
    pub fn build(self) -> Pool<T> {
        Pool::assemble(PoolConfig {
            allocator: self.allocator,
            release_handler: self.release_handler,
            destroy_handler: self.destroy_handler,
            eviction: self.eviction,
            strategy: self.strategy,
            order: self.order,
            executor: self.executor,
            clock: self.clock,
            metrics: self.metrics,
        })
    }
}
