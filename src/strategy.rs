//! Allocation strategies gating how many live resources may exist

use std::sync::atomic::{AtomicUsize, Ordering};

/// Gates resource creation with a permit counter.
///
/// Every live resource holds exactly one permit, reserved through
/// [`try_get`](AllocationStrategy::try_get) before the allocator runs and
/// restored through [`return_permits`](AllocationStrategy::return_permits)
/// when the resource is destroyed (or when a reserved permit was never
/// converted into a live resource).
///
/// `try_get` returning `0` is not an error: the pool treats it as "no
/// capacity right now" and leaves the borrower pending.
pub trait AllocationStrategy: Send + Sync + 'static {
    /// Atomically reserve permits for `desired` resources, returning how
    /// many were actually granted (possibly `0`).
    ///
    /// A strategy with a configured minimum may grant more than `desired`
    /// while the pool is below that minimum; the extra permits warm the
    /// idle store.
    fn try_get(&self, desired: usize) -> usize;

    /// Restore `n` permits. Never raises the available count above the
    /// configured maximum.
    fn return_permits(&self, n: usize);

    /// Non-authoritative hint of how many permits could currently be
    /// granted. Only used to decide whether an allocation is worth
    /// attempting.
    fn estimate(&self) -> usize;

    /// Lower bound of live resources targeted by [`Pool::warmup`].
    ///
    /// [`Pool::warmup`]: crate::Pool::warmup
    fn min(&self) -> usize {
        0
    }
}

/// Grants every request; the pool may grow without limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

impl AllocationStrategy for Unbounded {
    fn try_get(&self, desired: usize) -> usize {
        desired
    }

    fn return_permits(&self, _n: usize) {}

    fn estimate(&self) -> usize {
        usize::MAX
    }
}

/// Caps the number of live resources at `max`, optionally with a warmup
/// minimum.
#[derive(Debug)]
pub struct Bounded {
    max: usize,
    min: usize,
    available: AtomicUsize,
}

impl Bounded {
    /// A strategy granting at most `max` concurrent permits.
    pub fn new(max: usize) -> Self {
        Self::with_min(max, 0)
    }

    /// Like [`Bounded::new`], but [`Pool::warmup`] will pre-allocate up to
    /// `min` resources.
    ///
    /// # Panics
    ///
    /// Panics if `min > max`.
    ///
    /// [`Pool::warmup`]: crate::Pool::warmup
    pub fn with_min(max: usize, min: usize) -> Self {
        assert!(min <= max, "warmup minimum {min} exceeds maximum {max}");
        Self {
            max,
            min,
            available: AtomicUsize::new(max),
        }
    }

    /// How many permits are currently out, i.e. reserved and not returned.
    pub fn granted(&self) -> usize {
        self.max - self.available.load(Ordering::Acquire)
    }
}

impl AllocationStrategy for Bounded {
    fn try_get(&self, desired: usize) -> usize {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            let outstanding = self.max - current;
            let to_minimum = self.min.saturating_sub(outstanding);
            let granted = desired.max(to_minimum).min(current);
            if granted == 0 {
                return 0;
            }
            match self.available.compare_exchange_weak(
                current,
                current - granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return granted,
                Err(observed) => current = observed,
            }
        }
    }

    fn return_permits(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            let restored = (current + n).min(self.max);
            match self.available.compare_exchange_weak(
                current,
                restored,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn estimate(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    fn min(&self) -> usize {
        self.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_grants_everything() {
        let strategy = Unbounded;
        assert_eq!(strategy.try_get(10), 10);
        strategy.return_permits(10);
        assert_eq!(strategy.estimate(), usize::MAX);
        assert_eq!(strategy.min(), 0);
    }

    #[test]
    fn bounded_saturates_at_zero() {
        let strategy = Bounded::new(3);
        assert_eq!(strategy.try_get(2), 2);
        assert_eq!(strategy.try_get(2), 1);
        assert_eq!(strategy.try_get(1), 0);
        assert_eq!(strategy.estimate(), 0);
        assert_eq!(strategy.granted(), 3);
    }

    #[test]
    fn bounded_return_caps_at_max() {
        let strategy = Bounded::new(2);
        assert_eq!(strategy.try_get(2), 2);
        strategy.return_permits(5);
        assert_eq!(strategy.estimate(), 2);
        assert_eq!(strategy.granted(), 0);
    }

    #[test]
    fn bounded_min_feeds_warmup() {
        let strategy = Bounded::with_min(8, 3);
        assert_eq!(strategy.min(), 3);
    }

    #[test]
    fn bounded_grants_extras_up_to_minimum() {
        let strategy = Bounded::with_min(8, 3);
        assert_eq!(strategy.try_get(1), 3, "below the minimum, extras are granted");
        assert_eq!(strategy.try_get(1), 1, "at the minimum, only the request is granted");
        strategy.return_permits(4);
        assert_eq!(strategy.try_get(5), 5, "desired above the minimum wins");
    }

    #[test]
    #[should_panic(expected = "exceeds maximum")]
    fn bounded_rejects_min_above_max() {
        let _ = Bounded::with_min(1, 2);
    }
}
