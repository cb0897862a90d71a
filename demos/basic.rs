//! Basic usage examples for stale_pool

use async_trait::async_trait;
use stale_pool::{Manager, Pool, PoolConfiguration, PoolError};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Hands out numbered fake connections.
#[derive(Default)]
struct Connections {
    next: AtomicUsize,
}

#[async_trait]
impl Manager for Connections {
    type Type = String;
    type Error = Infallible;

    async fn create(&self, _cancel: &CancellationToken) -> Result<String, Infallible> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(format!("connection-{id}"))
    }

    fn close(&self, conn: String) -> Result<(), Infallible> {
        println!("   closing {conn}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== stale_pool - Basic Examples ===\n");

    // Example 1: Simple pool
    simple_pool().await?;

    // Example 2: Reuse order
    reuse_order().await?;

    // Example 3: Waiting for a slot
    waiting_for_slot().await?;

    // Example 4: Statistics
    statistics().await?;

    Ok(())
}

async fn simple_pool() -> Result<(), PoolError> {
    println!("1. Simple Pool:");
    let pool = Pool::new(Connections::default(), PoolConfiguration::default())?;
    let cancel = CancellationToken::new();

    {
        let conn = pool.get(&cancel).await?;
        println!("   Got object: {}", *conn);
        // Object automatically returned when dropped
    }

    println!("   Idle after return: {}", pool.idle_count());
    pool.close()?;
    println!();
    Ok(())
}

async fn reuse_order() -> Result<(), PoolError> {
    println!("2. Reuse Order:");
    let pool = Pool::new(
        Connections::default(),
        PoolConfiguration::new().with_capacity(3),
    )?;
    let cancel = CancellationToken::new();

    let first = pool.get(&cancel).await?;
    let second = pool.get(&cancel).await?;
    println!("   Checked out {} and {}", *first, *second);
    pool.put(first)?;
    pool.put(second)?;

    // the most recently returned object comes back first
    let again = pool.get(&cancel).await?;
    println!("   Next get returns {}", *again);
    drop(again);

    pool.close()?;
    println!();
    Ok(())
}

async fn waiting_for_slot() -> Result<(), PoolError> {
    println!("3. Waiting for a Slot:");
    let pool = Pool::new(
        Connections::default(),
        PoolConfiguration::new()
            .with_capacity(1)
            .with_acquire_timeout(Duration::from_millis(100)),
    )?;
    let cancel = CancellationToken::new();

    let held = pool.get(&cancel).await?;
    match pool.get(&cancel).await {
        Ok(_) => println!("   Second get: Success"),
        Err(err) => println!("   Second get: {err} (retryable: {})", err.is_retryable()),
    }

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            pool.get(&cancel).await.map(|conn| conn.to_string())
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    match waiter.await {
        Ok(Ok(conn)) => println!("   Waiter got {conn} after release"),
        Ok(Err(err)) => println!("   Waiter failed: {err}"),
        Err(err) => println!("   Waiter panicked: {err}"),
    }

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    if let Err(err) = pool.get(&cancelled).await {
        println!("   Cancelled get: {err}");
    }

    pool.close()?;
    println!();
    Ok(())
}

async fn statistics() -> Result<(), PoolError> {
    println!("4. Statistics:");
    let pool = Pool::new(Connections::default(), PoolConfiguration::default())?;
    let cancel = CancellationToken::new();

    {
        let _conn1 = pool.get(&cancel).await?;
        let _conn2 = pool.get(&cancel).await?;
        println!(
            "   Checked out: {}, Idle: {}",
            pool.total_count() - pool.idle_count(),
            pool.idle_count()
        );
    }
    let _conn3 = pool.get(&cancel).await?;

    let stats = pool.stats();
    println!("   Hit rate: {:.1}%", stats.hit_rate() * 100.0);
    println!("\n   Metrics:");
    let mut metrics: Vec<_> = stats.export().into_iter().collect();
    metrics.sort();
    for (key, value) in metrics {
        println!("     {key}: {value}");
    }
    Ok(())
}
