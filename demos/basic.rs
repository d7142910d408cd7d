//! Basic pool usage: bounded growth, explicit release, RAII give-back.
//!
//! Run with: cargo run --example basic

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use drainpool::{BoxError, PoolBuilder};

#[derive(Debug)]
struct Session {
    id: usize,
}

#[tokio::main]
async fn main() {
    let next_id = Arc::new(AtomicUsize::new(0));

    let pool = PoolBuilder::new(move || {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        async move {
            // Stand-in for an expensive handshake.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok::<_, BoxError>(Session { id })
        }
    })
    .max_size(2)
    .build();

    // First acquire allocates.
    let a = pool.acquire().await.unwrap();
    println!("got session #{}", a.id);

    // Explicit release puts the session back for reuse.
    a.release().await.unwrap();
    println!("idle after release: {}", pool.idle_size());

    // The same session comes back; no new allocation happened.
    let b = pool.acquire().await.unwrap();
    println!("reused session #{} (acquired {} times)", b.id, b.acquire_count());

    // Dropping the handle gives it back in the background.
    drop(b);

    pool.shutdown().await;
    println!("pool disposed: {}", pool.is_disposed());
}
