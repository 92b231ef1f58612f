use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use queuepool::{
    BuildError, ConnectionState, EventListener, Holder, Object, OverflowPolicy, PoolError,
    PoolEvent, StatsCollector,
};

type Pool = queuepool::Pool<Manager>;

#[derive(Default)]
struct Manager {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

#[async_trait]
impl queuepool::Manager for Manager {
    type Type = usize;
    type Error = ();

    async fn create(&self) -> Result<usize, ()> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    fn destroy(&self, _conn: usize) {
        let _ = self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn zero_base_size_is_rejected() {
    let err = Pool::builder(Manager::default())
        .base_size(0)
        .max_overflow(4)
        .build()
        .unwrap_err();
    assert_eq!(err, BuildError::ZeroBaseSize);
}

#[tokio::test]
async fn events_follow_connection_lifecycle() {
    let pool = Pool::builder(Manager::default())
        .base_size(1)
        .build()
        .unwrap();
    let mut events = pool.subscribe();

    let conn = pool.acquire("a", None).await.unwrap();
    let id = Object::id(&conn);
    drop(conn);
    let conn = pool.acquire("b", None).await.unwrap();
    pool.discard(conn).unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            PoolEvent::Connect { id: c, overflow } => {
                assert_eq!((c, overflow), (id, 0));
                "connect"
            }
            PoolEvent::Checkout { holder, .. } => {
                assert!(holder == Holder::from("a") || holder == Holder::from("b"));
                "checkout"
            }
            PoolEvent::Checkin { .. } => "checkin",
            PoolEvent::Close { id: c } => {
                assert_eq!(c, id);
                "close"
            }
            other => panic!("unexpected event: {:?}", other),
        });
    }
    assert_eq!(
        kinds,
        vec!["connect", "checkout", "checkin", "checkout", "close"]
    );
    assert_eq!(pool.connection_state(id), Some(ConnectionState::Closed));
}

#[tokio::test]
async fn dispose_fails_waiters_and_closes_connections() {
    let pool = Pool::builder(Manager::default())
        .base_size(2)
        .build()
        .unwrap();
    let stats = StatsCollector::attach(&pool);

    let idle = pool.get().await.unwrap();
    let in_use = pool.get().await.unwrap();
    drop(idle);
    let held = pool.get().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await.map(drop) })
    };
    while pool.status().waiting == 0 {
        tokio::task::yield_now().await;
    }

    pool.dispose();
    assert!(pool.is_disposed());
    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Disposed)));
    assert!(matches!(pool.get().await, Err(PoolError::Disposed)));

    // Checked out connections survive until their holders let go.
    assert_eq!(pool.status().in_use, 2);
    drop(in_use);
    pool.release(held).unwrap();

    let status = pool.status();
    assert_eq!(status.size, 0);
    assert_eq!(status.idle, 0);
    assert_eq!(pool.manager().destroyed.load(Ordering::SeqCst), 2);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.connections_closed, 2);
    assert_eq!(snapshot.current_active, 0);
    assert_eq!(snapshot.disposed_failures, 2);
}

#[tokio::test]
async fn dispose_closes_idle_connections_right_away() {
    let pool = Pool::builder(Manager::default())
        .base_size(2)
        .build()
        .unwrap();
    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    drop(a);
    assert_eq!(pool.status().idle, 1);

    pool.dispose();
    assert_eq!(pool.manager().destroyed.load(Ordering::SeqCst), 1);
    let status = pool.status();
    assert_eq!(status.idle, 0);
    assert_eq!(status.size, 1);

    drop(b);
    assert_eq!(pool.manager().destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.status().size, 0);
}

#[derive(Default)]
struct SlowManager {
    destroyed: AtomicUsize,
}

#[async_trait]
impl queuepool::Manager for SlowManager {
    type Type = ();
    type Error = ();

    async fn create(&self) -> Result<(), ()> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    fn destroy(&self, _conn: ()) {
        let _ = self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn dispose_during_create_destroys_new_connection() {
    let pool = queuepool::Pool::builder(SlowManager::default())
        .base_size(1)
        .build()
        .unwrap();
    let stats = StatsCollector::attach(&pool);
    let mut events = pool.subscribe();

    let creating = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire("a", None).await.map(drop) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.status().size, 1);

    pool.dispose();
    assert!(matches!(creating.await.unwrap(), Err(PoolError::Disposed)));
    assert_eq!(pool.manager().destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status().size, 0);

    assert!(matches!(
        events.try_recv(),
        Ok(PoolEvent::Connect { overflow: 0, .. })
    ));
    assert!(matches!(events.try_recv(), Ok(PoolEvent::Close { .. })));
    assert!(matches!(
        events.try_recv(),
        Ok(PoolEvent::AcquireFailed { .. })
    ));
    assert_eq!(stats.snapshot().disposed_failures, 1);
    assert_eq!(stats.snapshot().current_active, 0);
}

/// Panics on the first checkout after being armed.
#[derive(Default)]
struct PanickingListener {
    armed: AtomicBool,
}

impl EventListener for PanickingListener {
    fn on_event(&self, event: &PoolEvent) {
        if matches!(event, PoolEvent::Checkout { .. }) && self.armed.swap(false, Ordering::SeqCst)
        {
            panic!("listener failed");
        }
    }
}

#[tokio::test]
async fn panicking_listener_does_not_leak_idle_checkout() {
    let listener = Arc::new(PanickingListener::default());
    let pool = Pool::builder(Manager::default())
        .base_size(1)
        .listener(listener.clone())
        .build()
        .unwrap();
    drop(pool.get().await.unwrap());
    assert_eq!(pool.status().idle, 1);

    listener.armed.store(true, Ordering::SeqCst);
    let panicked = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await.map(drop) })
    };
    assert!(panicked.await.unwrap_err().is_panic());

    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.in_use, 0);
    assert!(pool.checked_out().is_empty());
    drop(pool.get().await.unwrap());
}

#[tokio::test]
async fn release_into_foreign_pool_is_rejected() {
    let a = Pool::builder(Manager::default()).base_size(1).build().unwrap();
    let b = Pool::builder(Manager::default()).base_size(1).build().unwrap();

    let conn = a.get().await.unwrap();
    let id = Object::id(&conn);
    assert!(matches!(b.release(conn), Err(PoolError::InvalidRelease(i)) if i == id));

    // The connection went back to the pool it came from, `b` is untouched.
    assert_eq!(a.status().idle, 1);
    assert_eq!(a.status().in_use, 0);
    assert_eq!(b.status().size, 0);
}

#[tokio::test]
async fn overflow_close_policy() {
    let pool = Pool::builder(Manager::default())
        .base_size(1)
        .max_overflow(2)
        .overflow_policy(OverflowPolicy::Close)
        .build()
        .unwrap();
    let stats = StatsCollector::attach(&pool);

    let conns = vec![
        pool.get().await.unwrap(),
        pool.get().await.unwrap(),
        pool.get().await.unwrap(),
    ];
    assert_eq!(
        conns.iter().filter(|c| Object::is_overflow(c)).count(),
        2
    );
    assert_eq!(pool.status().overflow, 2);
    drop(conns);

    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.overflow, 0);
    assert_eq!(stats.snapshot().connections_closed, 2);
    assert_eq!(stats.snapshot().max_overflow_used, 2);
}

#[tokio::test]
async fn idle_connections_are_reused_oldest_first() {
    let pool = Pool::builder(Manager::default())
        .base_size(3)
        .build()
        .unwrap();

    let first = pool.get().await.unwrap();
    let second = pool.get().await.unwrap();
    let (first_id, second_id) = (Object::id(&first), Object::id(&second));
    drop(second);
    drop(first);

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    assert_eq!((Object::id(&a), Object::id(&b)), (second_id, first_id));
    assert_eq!(pool.manager().created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn query_timing() {
    let pool = Pool::builder(Manager::default())
        .base_size(1)
        .build()
        .unwrap();
    let stats = StatsCollector::attach(&pool);

    let conn = pool.get().await.unwrap();
    let value = pool.timed(async { *conn + 1 }).await;
    assert_eq!(value, 1);
    pool.record_query(Duration::from_millis(4));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.queries, 2);
    assert!(snapshot.summary().avg_query_latency.is_some());
}
