//! The handle lent to borrowers and its lifecycle metadata

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::errors::{PoolError, PoolResult};
use crate::pool::PoolInner;

/// Read-only view of a resource's lifecycle, handed to eviction predicates.
#[derive(Debug, Clone, Copy)]
pub struct RefMetadata {
    /// Time since the resource was allocated.
    pub age: Duration,

    /// Time since the resource was last released back to the pool. Zero for
    /// a freshly allocated resource.
    pub idle: Duration,

    /// How many times the resource has been handed to a borrower.
    pub acquire_count: u32,
}

/// Mutable lifecycle record travelling with the resource.
///
/// `allocated_at` and `acquire_count` survive recycling so that age- and
/// usage-based eviction predicates see the resource's full history;
/// `last_release` is restamped every time the resource goes back to idle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotMeta {
    pub(crate) allocated_at: Instant,
    pub(crate) last_release: Instant,
    pub(crate) acquire_count: u32,
}

impl SlotMeta {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            allocated_at: now,
            last_release: now,
            acquire_count: 0,
        }
    }

    pub(crate) fn view(&self, now: Instant) -> RefMetadata {
        RefMetadata {
            age: now.saturating_duration_since(self.allocated_at),
            idle: now.saturating_duration_since(self.last_release),
            acquire_count: self.acquire_count,
        }
    }
}

/// A resource sitting in the idle store, waiting for reuse.
pub(crate) struct IdleSlot<T> {
    pub(crate) value: T,
    pub(crate) meta: SlotMeta,
}

impl<T> IdleSlot<T> {
    pub(crate) fn new(value: T, now: Instant) -> Self {
        Self {
            value,
            meta: SlotMeta::new(now),
        }
    }
}

/// What a [`PooledRef`] carries until one of the end-of-use paths takes it.
pub(crate) struct Parts<T> {
    pub(crate) value: T,
    pub(crate) meta: SlotMeta,
}

/// Exclusive handle to a pooled resource.
///
/// The handle dereferences to the resource. End of use is signalled through
/// one of three paths, each consuming the handle's payload exactly once:
///
/// - [`release`](PooledRef::release) runs the configured release handler and
///   either recycles the resource into the idle store or destroys it;
/// - [`invalidate`](PooledRef::invalidate) destroys it unconditionally;
/// - dropping the handle routes through the release pipeline on a spawned
///   task, so resources are never leaked by an abandoned handle.
pub struct PooledRef<T: Send + 'static> {
    parts: Option<Parts<T>>,
    pool: Weak<PoolInner<T>>,
}

impl<T: Send + 'static> PooledRef<T> {
    pub(crate) fn new(slot: IdleSlot<T>, pool: Weak<PoolInner<T>>) -> Self {
        Self {
            parts: Some(Parts {
                value: slot.value,
                meta: slot.meta,
            }),
            pool,
        }
    }

    /// When the resource was allocated.
    pub fn allocated_at(&self) -> Instant {
        self.parts.as_ref().expect("parts taken").meta.allocated_at
    }

    /// How many times the resource has been handed out, this acquisition
    /// included.
    pub fn acquire_count(&self) -> u32 {
        self.parts.as_ref().expect("parts taken").meta.acquire_count
    }

    /// Return the resource to the pool.
    ///
    /// Runs the release handler, then the eviction predicate; the resource
    /// is recycled into the idle store unless the predicate rejects it or
    /// the pool has shut down, in which case it is destroyed. A release
    /// handler error also destroys the resource and is surfaced to this
    /// caller as [`PoolError::ReleaseHandler`].
    ///
    /// The pipeline runs on a spawned task: dropping the returned future
    /// does not abort it.
    pub async fn release(mut self) -> PoolResult<()> {
        let Some(parts) = self.parts.take() else {
            return Ok(());
        };
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        pool.clone().spawn(async move {
            let outcome = pool.release_pipeline(parts).await;
            let _ = tx.send(outcome);
        });
        rx.await
            .unwrap_or(Err(PoolError::InvalidState("release pipeline vanished")))
    }

    /// Destroy the resource without attempting to recycle it.
    ///
    /// Subsequent calls on an already-terminated handle are no-ops; like
    /// [`release`](PooledRef::release), the underlying pipeline is not
    /// cancelled by dropping the future.
    pub async fn invalidate(mut self) {
        let Some(parts) = self.parts.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let (tx, rx) = oneshot::channel::<()>();
        pool.clone().spawn(async move {
            pool.invalidate_pipeline(parts.value).await;
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Undo a failed hand-off: dismantle the handle back into an idle slot.
    pub(crate) fn into_idle(mut self) -> IdleSlot<T> {
        let mut parts = self.parts.take().expect("parts taken");
        parts.meta.acquire_count -= 1;
        IdleSlot {
            value: parts.value,
            meta: parts.meta,
        }
    }
}

impl<T: Send + 'static> Deref for PooledRef<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.parts.as_ref().expect("parts taken").value
    }
}

impl<T: Send + 'static> DerefMut for PooledRef<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.parts.as_mut().expect("parts taken").value
    }
}

impl<T: Send + 'static> Drop for PooledRef<T> {
    fn drop(&mut self) {
        let Some(parts) = self.parts.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.reclaim_dropped(parts);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for PooledRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledRef")
            .field("live", &self.parts.is_some())
            .finish()
    }
}
