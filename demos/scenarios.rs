//! Runs the pool through a few load patterns and prints what happened.
//!
//! ```text
//! cargo run --example scenarios -- exhaustion
//! RUST_LOG=queuepool=trace cargo run --example scenarios -- leak
//! ```

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use queuepool::{Object, PoolConfig, PoolError, StatsCollector, StatsSnapshot};

/// A fake database connection.
#[derive(Debug)]
struct Connection {
    id: u64,
}

impl Connection {
    async fn execute(&self, query: &str, duration: Duration) {
        tracing::debug!(connection = self.id, query, "executing");
        sleep(duration).await;
    }
}

struct Database {
    connect_latency: Duration,
    next_id: AtomicU64,
}

#[async_trait]
impl queuepool::Manager for Database {
    type Type = Connection;
    type Error = std::io::Error;

    async fn create(&self) -> Result<Connection, Self::Error> {
        sleep(self.connect_latency).await;
        Ok(Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn destroy(&self, conn: Connection) {
        tracing::debug!(connection = conn.id, "disconnecting");
    }
}

type Pool = queuepool::Pool<Database>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// A few clients, plenty of capacity.
    Normal,
    /// As many clients as the pool has capacity, overflow gets used.
    Saturation,
    /// More clients than capacity, the surplus times out.
    Exhaustion,
    /// Some clients never return their connection.
    Leak,
}

#[derive(Debug, Parser)]
#[command(about = "Exercise a connection pool under different loads")]
struct Args {
    #[arg(value_enum, default_value = "normal")]
    scenario: Scenario,

    /// Simulated time it takes to open a connection, in milliseconds.
    #[arg(long, default_value_t = 50)]
    connect_latency: u64,
}

fn build(config: PoolConfig, connect_latency: Duration) -> (Pool, Arc<StatsCollector>) {
    let database = Database {
        connect_latency,
        next_id: AtomicU64::new(0),
    };
    let stats = Arc::new(StatsCollector::new());
    let pool = Pool::builder(database)
        .config(config)
        .listener(stats.clone())
        .build()
        .expect("valid pool configuration");
    info!(
        base_size = config.base_size,
        max_overflow = config.max_overflow,
        capacity = config.max_size(),
        timeout = ?config.timeout,
        "pool configured"
    );
    (pool, stats)
}

async fn client_work(
    pool: Pool,
    client: usize,
    queries: usize,
    hold: Duration,
) -> Result<(), PoolError<std::io::Error>> {
    info!(client, "requesting connection");
    let conn = pool.acquire(format!("client-{}", client), None).await?;
    info!(client, connection = Object::id(&conn).get(), "got connection");
    for _ in 0..queries {
        pool.timed(conn.execute("SELECT 1", hold)).await;
    }
    pool.release(conn)
}

async fn run_clients(pool: &Pool, clients: usize, queries: usize, hold: Duration) -> (usize, usize) {
    let handles: Vec<_> = (0..clients)
        .map(|client| tokio::spawn(client_work(pool.clone(), client, queries, hold)))
        .collect();
    let mut successful = 0;
    let mut failed = 0;
    for (client, handle) in handles.into_iter().enumerate() {
        match handle.await.expect("client task panicked") {
            Ok(()) => successful += 1,
            Err(e) => {
                warn!(client, error = %e, "client failed");
                failed += 1;
            }
        }
    }
    (successful, failed)
}

fn print_stats(snapshot: &StatsSnapshot, successful: usize, failed: usize) {
    let summary = snapshot.summary();
    println!("{}", "=".repeat(60));
    println!("SUMMARY");
    println!("{}", "=".repeat(60));
    println!("Created:           {}", snapshot.connections_created);
    println!("Closed:            {}", snapshot.connections_closed);
    println!("Checkouts:         {}", snapshot.checkouts);
    println!("Checkins:          {}", snapshot.checkins);
    println!("Active:            {}", snapshot.current_active);
    println!("Max Overflow Used: {}", snapshot.max_overflow_used);
    println!("Timeouts:          {}", snapshot.acquire_timeouts);
    if let Some(rate) = summary.reuse_rate {
        println!("Reuse Rate:        {:.1}%", rate * 100.0);
    }
    if let Some(latency) = summary.avg_query_latency {
        println!("Avg Query:         {:?}", latency);
    }
    if let Some(wait) = summary.avg_wait {
        println!("Avg Wait:          {:?}", wait);
    }
    println!("Successful:        {}", successful);
    println!("Failed:            {}", failed);
    println!("{}", "=".repeat(60));
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let latency = Duration::from_millis(args.connect_latency);
    let config = |base_size, max_overflow, timeout_secs| PoolConfig {
        max_overflow,
        timeout: Some(Duration::from_secs(timeout_secs)),
        ..PoolConfig::new(base_size)
    };

    match args.scenario {
        Scenario::Normal => {
            let (pool, stats) = build(config(5, 10, 30), latency);
            let (ok, failed) = run_clients(&pool, 3, 3, Duration::from_millis(200)).await;
            print_stats(&stats.snapshot(), ok, failed);
        }
        Scenario::Saturation => {
            let (pool, stats) = build(config(3, 3, 30), latency);
            let (ok, failed) = run_clients(&pool, 6, 3, Duration::from_millis(500)).await;
            print_stats(&stats.snapshot(), ok, failed);
        }
        Scenario::Exhaustion => {
            let (pool, stats) = build(config(1, 2, 2), latency);
            let (ok, failed) = run_clients(&pool, 10, 1, Duration::from_secs(3)).await;
            print_stats(&stats.snapshot(), ok, failed);
        }
        Scenario::Leak => {
            let (pool, stats) = build(config(3, 0, 3), latency);

            let mut leaked = Vec::new();
            for client in 0..2 {
                let conn = pool
                    .acquire(format!("leaky-{}", client), None)
                    .await
                    .expect("pool has capacity for the leaky clients");
                conn.execute("SELECT pg_sleep(1)", Duration::from_secs(1))
                    .await;
                warn!(client, "leaking connection");
                leaked.push(conn);
            }

            let (ok, failed) = run_clients(&pool, 8, 1, Duration::from_secs(1)).await;
            print_stats(&stats.snapshot(), ok + leaked.len(), failed);

            for info in pool.leaked(Duration::from_secs(1)) {
                warn!(
                    connection = %info.id,
                    holder = %info.holder,
                    held = ?info.held_for(),
                    "connection leaked"
                );
            }
            info!(count = leaked.len(), "cleaning up leaked connections");
            drop(leaked);
        }
    }
}
