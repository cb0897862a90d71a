//! Advanced features: idle refill, stale reaping, circuit breaker, metrics

use async_trait::async_trait;
use stale_pool::{Manager, Pool, PoolConfiguration, PoolError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Connection {
    id: usize,
    opened_at: Instant,
}

#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error("server at {0} refused the connection")]
    Refused(&'static str),
    #[error("connection {0} went away")]
    Gone(usize),
}

struct Database {
    address: &'static str,
    next_id: AtomicUsize,
    online: AtomicBool,
}

impl Database {
    fn new(address: &'static str) -> Self {
        Self {
            address,
            next_id: AtomicUsize::new(1),
            online: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Manager for Database {
    type Type = Connection;
    type Error = ConnectError;

    async fn create(&self, cancel: &CancellationToken) -> Result<Connection, ConnectError> {
        // simulated handshake
        tokio::select! {
            () = cancel.cancelled() => return Err(ConnectError::Refused(self.address)),
            () = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(ConnectError::Refused(self.address));
        }
        Ok(Connection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            opened_at: Instant::now(),
        })
    }

    fn close(&self, conn: Connection) -> Result<(), ConnectError> {
        println!(
            "   closing connection {} after {:?}",
            conn.id,
            conn.opened_at.elapsed()
        );
        Ok(())
    }

    fn validate(&self, conn: &Connection) -> Result<(), ConnectError> {
        // pretend odd connections above 10 break while in use
        if conn.id > 10 && conn.id % 2 == 1 {
            return Err(ConnectError::Gone(conn.id));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stale_pool=debug".into()),
        )
        .init();

    println!("=== stale_pool - Advanced Features ===\n");

    // Example 1: Warm idle objects
    min_idle_refill().await?;

    // Example 2: Stale reaping
    stale_reaping().await?;

    // Example 3: Circuit breaker
    circuit_breaker_demo().await?;

    // Example 4: Unmanaged objects and validation
    unmanaged_and_validation().await?;

    // Example 5: Prometheus metrics
    prometheus_export().await?;

    Ok(())
}

async fn min_idle_refill() -> Result<(), PoolError> {
    println!("1. Idle Refill:");
    let pool = Pool::new(
        Database::new("db:5432"),
        PoolConfiguration::new().with_capacity(5).with_min_idle(2),
    )?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("   Idle after start: {}", pool.idle_count());

    let cancel = CancellationToken::new();
    let conn = pool.get(&cancel).await?;
    println!("   Got connection {} (hits: {})", conn.id, pool.stats().hits);

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("   Idle after refill: {}", pool.idle_count());

    drop(conn);
    println!("   Idle after return: {}", pool.idle_count());
    pool.close()?;
    println!();
    Ok(())
}

async fn stale_reaping() -> Result<(), PoolError> {
    println!("2. Stale Reaping:");
    let pool = Pool::new(
        Database::new("db:5432"),
        PoolConfiguration::new()
            .with_capacity(3)
            .with_idle_timeout(Duration::from_millis(300))
            .with_max_object_age(Duration::from_secs(60))
            .with_reap_interval(Duration::from_millis(100)),
    )?;
    let cancel = CancellationToken::new();

    let first = pool.get(&cancel).await?;
    let second = pool.get(&cancel).await?;
    drop(first);
    drop(second);
    println!("   Idle before timeout: {}", pool.idle_count());

    println!("   Waiting for idle timeout...");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = pool.stats();
    println!(
        "   Idle after timeout: {}, evicted: {}",
        stats.idle_count, stats.stale_evictions
    );
    pool.close()?;
    println!();
    Ok(())
}

async fn circuit_breaker_demo() -> Result<(), PoolError> {
    println!("3. Circuit Breaker:");
    let pool = Pool::new(
        Database::new("db:5432"),
        PoolConfiguration::new()
            .with_capacity(3)
            .with_circuit_breaker_cooldown(Duration::from_millis(200)),
    )?;
    let cancel = CancellationToken::new();
    pool.manager().online.store(false, Ordering::SeqCst);

    for attempt in 1..=5 {
        match pool.get(&cancel).await {
            Ok(conn) => println!("   Attempt {attempt}: got connection {}", conn.id),
            Err(err) => println!(
                "   Attempt {attempt}: {err} (breaker: {:?})",
                pool.circuit_breaker_state()
            ),
        }
    }
    println!("   Constructor failures: {}", pool.stats().creation_failures);

    pool.manager().online.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    match pool.get(&cancel).await {
        Ok(conn) => println!("   After cooldown: got connection {}", conn.id),
        Err(err) => println!("   After cooldown: {err}"),
    }
    println!("   Breaker: {:?}", pool.circuit_breaker_state());

    pool.close()?;
    println!();
    Ok(())
}

async fn unmanaged_and_validation() -> Result<(), PoolError> {
    println!("4. Unmanaged Objects and Validation:");
    let pool = Pool::new(
        Database::new("db:5432"),
        PoolConfiguration::new().with_capacity(1),
    )?;
    let cancel = CancellationToken::new();

    let pooled = pool.get(&cancel).await?;
    let extra = pool.new_object(&cancel).await?;
    println!(
        "   Pooled: {}, extra: {} (pooled: {}), total: {}",
        pooled.id,
        extra.id,
        extra.is_pooled(),
        pool.total_count()
    );
    pool.put(extra)?;
    pool.put(pooled)?;
    println!("   Idle after returning both: {}", pool.idle_count());

    // burn through ids until the validator starts rejecting
    for _ in 0..10 {
        let conn = pool.new_object(&cancel).await?;
        pool.remove(conn, None)?;
    }
    let broken = pool.new_object(&cancel).await?;
    let id = broken.id;
    match pool.put(broken) {
        Ok(()) => println!("   Connection {id} accepted"),
        Err(err) => println!("   Connection {id} rejected: {err}"),
    }
    println!("   Validation failures: {}", pool.stats().validation_failures);

    pool.close()?;
    println!();
    Ok(())
}

async fn prometheus_export() -> Result<(), PoolError> {
    println!("5. Prometheus Metrics Export:");
    let pool = Pool::new(Database::new("db:5432"), PoolConfiguration::default())?;
    let cancel = CancellationToken::new();

    let _conn1 = pool.get(&cancel).await?;
    let _conn2 = pool.get(&cancel).await?;

    let mut tags = HashMap::new();
    tags.insert("service".to_string(), "example".to_string());
    tags.insert("env".to_string(), "dev".to_string());

    match stale_pool::MetricsExporter::export_prometheus(&pool.stats(), "example_pool", Some(&tags)) {
        Ok(text) => println!("{text}"),
        Err(err) => println!("   export failed: {err}"),
    }
    Ok(())
}
