//! Ready-made eviction predicates
//!
//! An eviction predicate decides whether a resource is still fit for the
//! pool. It runs synchronously at two points: when a resource is released
//! (before recycling) and when an idle resource is about to be handed to a
//! borrower (second chance, catching resources that went stale while
//! sitting idle). `true` means destroy.

use std::sync::Arc;
use std::time::Duration;

use crate::slot::RefMetadata;

/// Decision function marking a resource unfit for further reuse.
///
/// Must be pure, fast and non-blocking. A panicking predicate is treated as
/// `true` (evict) and logged.
pub type EvictionPredicate<T> = Arc<dyn Fn(&T, &RefMetadata) -> bool + Send + Sync>;

/// Keep everything. The default.
pub fn never<T>() -> EvictionPredicate<T> {
    Arc::new(|_: &T, _: &RefMetadata| false)
}

/// Evict resources that have been idle for `ttl` or longer.
///
/// # Examples
///
/// ```
/// use drainpool::eviction;
/// use std::time::Duration;
///
/// let predicate = eviction::idle_more_than::<u32>(Duration::from_secs(30));
/// # let _ = predicate;
/// ```
pub fn idle_more_than<T>(ttl: Duration) -> EvictionPredicate<T> {
    Arc::new(move |_: &T, meta: &RefMetadata| meta.idle >= ttl)
}

/// Evict resources allocated `ttl` or longer ago, regardless of use.
pub fn older_than<T>(ttl: Duration) -> EvictionPredicate<T> {
    Arc::new(move |_: &T, meta: &RefMetadata| meta.age >= ttl)
}

/// Evict resources that have served more than `limit` acquisitions.
pub fn acquired_more_than<T>(limit: u32) -> EvictionPredicate<T> {
    Arc::new(move |_: &T, meta: &RefMetadata| meta.acquire_count > limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(age_ms: u64, idle_ms: u64, acquire_count: u32) -> RefMetadata {
        RefMetadata {
            age: Duration::from_millis(age_ms),
            idle: Duration::from_millis(idle_ms),
            acquire_count,
        }
    }

    #[test]
    fn never_keeps_everything() {
        let predicate = never::<u32>();
        assert!(!predicate(&1, &meta(1_000_000, 1_000_000, u32::MAX)));
    }

    #[test]
    fn idle_ttl_is_inclusive() {
        let predicate = idle_more_than::<u32>(Duration::from_millis(100));
        assert!(!predicate(&1, &meta(0, 99, 1)));
        assert!(predicate(&1, &meta(0, 100, 1)));
        assert!(predicate(&1, &meta(0, 150, 1)));
    }

    #[test]
    fn age_ttl_ignores_idle_time() {
        let predicate = older_than::<u32>(Duration::from_millis(100));
        assert!(predicate(&1, &meta(100, 0, 1)));
        assert!(!predicate(&1, &meta(50, 500, 1)));
    }

    #[test]
    fn acquire_count_limit_is_exclusive() {
        let predicate = acquired_more_than::<u32>(3);
        assert!(!predicate(&1, &meta(0, 0, 3)));
        assert!(predicate(&1, &meta(0, 0, 4)));
    }
}
