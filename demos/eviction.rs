//! Eviction and warmup: idle resources past their TTL are destroyed and
//! replaced on the next acquire.
//!
//! Run with: cargo run --example eviction

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drainpool::{BoxError, PoolBuilder};

#[tokio::main]
async fn main() {
    let allocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&allocations);

    let pool = PoolBuilder::new(move || {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        async move { Ok::<_, BoxError>(format!("conn-{n}")) }
    })
    .max_size_with_min(4, 2)
    .evict_idle(Duration::from_millis(200))
    .destroy_handler(|conn: String| async move {
        println!("destroying stale {conn}");
        Ok(())
    })
    .build();

    let warmed = pool.warmup().await.unwrap();
    println!("warmed up {warmed} connections, idle: {}", pool.idle_size());

    let conn = pool.acquire().await.unwrap();
    println!("using {}", *conn);
    conn.release().await.unwrap();

    // Let everything in the pool go stale.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let fresh = pool.acquire().await.unwrap();
    println!(
        "after the idle TTL: got {} ({} allocations total)",
        *fresh,
        allocations.load(Ordering::Relaxed)
    );
    drop(fresh);

    pool.shutdown().await;
}
