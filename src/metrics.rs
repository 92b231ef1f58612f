use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{EventListener, FailureReason, Manager, Pool, PoolEvent};

/// Aggregated statistics of a pool, collected from its [`PoolEvent`]s.
///
/// Every event updates exactly one counter group with relaxed atomics, so
/// recording never blocks the task emitting the event.
#[derive(Debug, Default)]
pub struct StatsCollector {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    checkouts: AtomicU64,
    checkins: AtomicU64,
    max_overflow_used: AtomicUsize,
    acquire_timeouts: AtomicU64,
    create_failures: AtomicU64,
    disposed_failures: AtomicU64,
    /// The total time tasks were waiting for a connection in microseconds.
    total_waiting: AtomicU64,
    /// The total time connections were checked out in microseconds.
    total_active: AtomicU64,
    queries: AtomicU64,
    /// The total duration of timed queries in microseconds.
    total_query: AtomicU64,
}

/// Point-in-time copy of the counters of a [`StatsCollector`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections created by the manager.
    pub connections_created: u64,
    /// Connections destroyed.
    pub connections_closed: u64,
    /// Connections handed to callers.
    pub checkouts: u64,
    /// Connections released by callers.
    pub checkins: u64,
    /// Connections alive right now (`created - closed`).
    pub current_active: u64,
    /// Highest number of overflow connections alive at once.
    pub max_overflow_used: usize,
    /// Acquisitions that ran into their deadline.
    pub acquire_timeouts: u64,
    /// Acquisitions that failed because the manager couldn't create a
    /// connection.
    pub create_failures: u64,
    /// Acquisitions rejected because the pool was disposed.
    pub disposed_failures: u64,
    /// Total time callers spent waiting for a connection.
    pub total_wait: Duration,
    /// Total time connections spent checked out.
    pub total_active: Duration,
    /// Number of timed queries.
    pub queries: u64,
    /// Total duration of timed queries.
    pub total_query: Duration,
}

/// Metrics derived from a [`StatsSnapshot`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsSummary {
    /// Share of checkouts served without creating a new connection.
    ///
    /// [`None`] when nothing has been checked out yet.
    pub reuse_rate: Option<f64>,
    /// Average duration of a timed query.
    pub avg_query_latency: Option<Duration>,
    /// Average time a checkout spent waiting.
    pub avg_wait: Option<Duration>,
}

// 64bit microseconds is 580000 years - really not important
#[allow(clippy::cast_possible_truncation)]
fn micros(d: Duration) -> u64 {
    d.as_micros() as u64
}

impl StatsCollector {
    /// Creates a new collector with all counters set to zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new collector and registers it with the given [`Pool`].
    pub fn attach<M: Manager>(pool: &Pool<M>) -> Arc<Self> {
        let stats = Arc::new(Self::new());
        pool.add_listener(stats.clone());
        stats
    }

    /// Returns the counters as of this call.
    pub fn snapshot(&self) -> StatsSnapshot {
        let connections_created = self.connections_created.load(Ordering::Relaxed);
        let connections_closed = self.connections_closed.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_created,
            connections_closed,
            checkouts: self.checkouts.load(Ordering::Relaxed),
            checkins: self.checkins.load(Ordering::Relaxed),
            current_active: connections_created.saturating_sub(connections_closed),
            max_overflow_used: self.max_overflow_used.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            create_failures: self.create_failures.load(Ordering::Relaxed),
            disposed_failures: self.disposed_failures.load(Ordering::Relaxed),
            total_wait: Duration::from_micros(self.total_waiting.load(Ordering::Relaxed)),
            total_active: Duration::from_micros(self.total_active.load(Ordering::Relaxed)),
            queries: self.queries.load(Ordering::Relaxed),
            total_query: Duration::from_micros(self.total_query.load(Ordering::Relaxed)),
        }
    }

    /// Shorthand for `self.snapshot().summary()`.
    pub fn summary(&self) -> StatsSummary {
        self.snapshot().summary()
    }
}

impl EventListener for StatsCollector {
    fn on_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::Connect { overflow, .. } => {
                let _ = self.connections_created.fetch_add(1, Ordering::Relaxed);
                let _ = self.max_overflow_used.fetch_max(*overflow, Ordering::Relaxed);
            }
            PoolEvent::Close { .. } => {
                let _ = self.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
            PoolEvent::Checkout { waited, .. } => {
                let _ = self.checkouts.fetch_add(1, Ordering::Relaxed);
                let _ = self.total_waiting.fetch_add(micros(*waited), Ordering::Relaxed);
            }
            PoolEvent::Checkin { held, .. } => {
                let _ = self.checkins.fetch_add(1, Ordering::Relaxed);
                let _ = self.total_active.fetch_add(micros(*held), Ordering::Relaxed);
            }
            PoolEvent::AcquireFailed { reason, .. } => {
                let counter = match reason {
                    FailureReason::Timeout => &self.acquire_timeouts,
                    FailureReason::CreateFailed => &self.create_failures,
                    FailureReason::Disposed => &self.disposed_failures,
                };
                let _ = counter.fetch_add(1, Ordering::Relaxed);
            }
            PoolEvent::QueryTimed { duration } => {
                let _ = self.queries.fetch_add(1, Ordering::Relaxed);
                let _ = self.total_query.fetch_add(micros(*duration), Ordering::Relaxed);
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
impl StatsSnapshot {
    /// Computes the derived metrics of this snapshot.
    #[must_use]
    pub fn summary(&self) -> StatsSummary {
        let reuse_rate = (self.checkouts > 0).then(|| {
            let reused = self.checkouts as f64 - self.connections_created as f64;
            reused / self.checkouts as f64
        });
        StatsSummary {
            reuse_rate,
            avg_query_latency: average(self.total_query, self.queries),
            avg_wait: average(self.total_wait, self.checkouts),
        }
    }
}

fn average(total: Duration, count: u64) -> Option<Duration> {
    if count == 0 {
        return None;
    }
    let micros = micros(total) / count;
    Some(Duration::from_micros(micros))
}
