use std::{fmt::Display, time::Duration};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

//const ITERATIONS: usize = 1_048_576;
const ITERATIONS: usize = 1 << 15;

struct Manager;

#[async_trait::async_trait]
impl queuepool::Manager for Manager {
    type Type = ();
    type Error = ();
    async fn create(&self) -> Result<Self::Type, Self::Error> {
        Ok(())
    }
}

type Pool = queuepool::Pool<Manager>;

#[derive(Copy, Clone, Debug)]
struct Config {
    base_size: usize,
    max_overflow: usize,
    workers: usize,
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "w{}s{}o{}",
            self.workers, self.base_size, self.max_overflow
        )
    }
}

impl Config {
    fn operations_per_worker(&self) -> usize {
        ITERATIONS / self.workers
    }

    async fn run(self, pool: Pool) {
        for _ in 0..self.operations_per_worker() {
            let _ = pool.get().await;
        }
    }

    /// Holds every connection across a yield so that the other workers
    /// have to queue up and get served by hand-off.
    async fn run_holding(self, pool: Pool, worker: usize) {
        let holder = format!("worker-{}", worker);
        for _ in 0..self.operations_per_worker() {
            let conn = pool
                .acquire(holder.as_str(), Some(Duration::from_secs(10)))
                .await
                .unwrap();
            tokio::task::yield_now().await;
            drop(conn);
        }
    }
}

#[rustfmt::skip]
const CONFIGS: &[Config] = &[
    // 8 workers
    Config { workers:  8, base_size:  2, max_overflow: 0 },
    Config { workers:  8, base_size:  2, max_overflow: 2 },
    Config { workers:  8, base_size:  8, max_overflow: 0 },
    // 16 workers
    Config { workers: 16, base_size:  4, max_overflow: 0 },
    Config { workers: 16, base_size:  4, max_overflow: 4 },
    Config { workers: 16, base_size: 16, max_overflow: 0 },
    // 32 workers
    Config { workers: 32, base_size:  8, max_overflow: 0 },
    Config { workers: 32, base_size:  8, max_overflow: 8 },
    Config { workers: 32, base_size: 32, max_overflow: 0 },
];

fn bench_get(cfg: Config) {
    let pool = Pool::builder(Manager)
        .base_size(cfg.base_size)
        .max_overflow(cfg.max_overflow)
        .build()
        .unwrap();

    std::thread::scope(|s| {
        for _ in 0..cfg.workers {
            s.spawn(|| {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap();

                runtime.block_on(cfg.run(pool.clone()));
            });
        }
    });
}

fn bench_hand_off(cfg: Config) {
    let pool = Pool::builder(Manager)
        .base_size(cfg.base_size)
        .max_overflow(cfg.max_overflow)
        .build()
        .unwrap();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_time()
        .build()
        .unwrap();

    runtime.block_on(async {
        let tasks: Vec<_> = (0..cfg.workers)
            .map(|worker| tokio::spawn(cfg.run_holding(pool.clone(), worker)))
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
    });
    assert_eq!(pool.status().waiting, 0);
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("managed");
    for &config in CONFIGS {
        group.bench_function(BenchmarkId::new("get", config), |b| {
            b.iter(|| bench_get(config))
        });
    }
    for config in CONFIGS.iter().filter(|c| c.workers > c.base_size + c.max_overflow) {
        group.bench_function(BenchmarkId::new("hand_off", config), |b| {
            b.iter(|| bench_hand_off(*config))
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
