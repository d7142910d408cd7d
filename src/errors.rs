//! Error types for the pool

use std::time::Duration;
use thiserror::Error;

/// Boxed error type accepted from allocator, release and destroy handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("acquire timed out after {0:?} while waiting for a resource")]
    AcquireTimeout(Duration),

    #[error("pool is shut down")]
    Shutdown,

    #[error("resource allocation failed: {0}")]
    Allocation(#[source] BoxError),

    #[error("release handler failed: {0}")]
    ReleaseHandler(#[source] BoxError),

    #[error("internal pool state violation: {0}")]
    InvalidState(&'static str),
}

pub type PoolResult<T> = Result<T, PoolError>;
