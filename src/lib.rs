//! # drainpool
//!
//! Generic, asynchronous, non-blocking object pool for resources that are
//! expensive to create but cheap to reuse: database connections, network
//! channels, precomputed tokens.
//!
//! ## Features
//!
//! - Lock-free matching of idle resources and waiting borrowers through a
//!   cooperative drain loop; no thread ever blocks inside the pool
//! - Bounded or unbounded growth through pluggable allocation strategies
//! - Asynchronous allocator, release and destroy handlers
//! - Eviction predicates evaluated on release and again on acquire
//! - FIFO, LIFO or thread-affine ordering of waiting borrowers
//! - Per-acquire deadlines, cancellation-safe waits, RAII give-back
//! - Warmup, graceful shutdown, injectable clock and metrics recording
//!
//! ## Quick Start
//!
//! ```rust
//! use drainpool::{BoxError, PoolBuilder};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = PoolBuilder::new(|| async { Ok::<_, BoxError>(Vec::<u8>::new()) })
//!     .max_size(4)
//!     .build();
//!
//! let buffer = pool.acquire().await.unwrap();
//! assert!(buffer.is_empty());
//! drop(buffer); // handed back to the pool in the background
//! # pool.shutdown().await;
//! # }
//! ```

mod clock;
mod config;
mod errors;
pub mod eviction;
mod metrics;
mod pending;
mod pool;
mod slot;
mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AcquisitionExecutor, BoxFuture, PendingOrder, PoolBuilder, TokioExecutor};
pub use errors::{BoxError, PoolError, PoolResult};
pub use eviction::EvictionPredicate;
pub use metrics::{InMemoryRecorder, MetricsSnapshot, NoOpRecorder, PoolMetricsRecorder};
pub use pool::Pool;
pub use slot::{PooledRef, RefMetadata};
pub use strategy::{AllocationStrategy, Bounded, Unbounded};
