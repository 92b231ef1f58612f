use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use queuepool::{ConnectionState, Object, PoolError, PoolEvent, TimeoutType};

type Pool = queuepool::Pool<Manager>;

#[derive(Default)]
struct Manager {
    created: AtomicUsize,
}

#[async_trait]
impl queuepool::Manager for Manager {
    type Type = usize;
    type Error = ();

    async fn create(&self) -> Result<usize, ()> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }
}

fn pool(base_size: usize) -> Pool {
    Pool::builder(Manager::default())
        .base_size(base_size)
        .build()
        .unwrap()
}

async fn wait_for_waiters(pool: &Pool, count: usize) {
    while pool.status().waiting < count {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn waiters_are_served_in_arrival_order() {
    let pool = pool(1);
    let conn = pool.get().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handles = Vec::new();
    for i in 0..5 {
        let task_pool = pool.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let conn = task_pool.acquire(format!("waiter-{}", i), None).await.unwrap();
            tx.send(i).unwrap();
            tokio::task::yield_now().await;
            drop(conn);
        }));
        wait_for_waiters(&pool, i + 1).await;
    }

    drop(conn);
    for handle in handles {
        handle.await.unwrap();
    }
    drop(tx);

    let mut order = Vec::new();
    while let Some(i) = rx.recv().await {
        order.push(i);
    }
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    assert_eq!(pool.manager().created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn released_connection_is_not_stolen_by_new_arrivals() {
    let pool = pool(1);
    let conn = pool.get().await.unwrap();
    let id = Object::id(&conn);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.acquire("patient", None).await.unwrap();
            Object::holder(&conn).clone()
        })
    };
    wait_for_waiters(&pool, 1).await;

    pool.release(conn).unwrap();

    // The connection went straight to the waiter without ever being idle.
    assert_eq!(pool.status().idle, 0);
    assert_eq!(pool.connection_state(id), Some(ConnectionState::InUse));
    assert_eq!(pool.checked_out()[0].holder.as_str(), "patient");
    assert!(matches!(
        pool.acquire("impatient", Some(Duration::ZERO)).await,
        Err(PoolError::Timeout(TimeoutType::Wait))
    ));

    assert_eq!(waiter.await.unwrap().as_str(), "patient");
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn cancelled_waiter_leaves_the_queue() {
    let pool = pool(1);
    let conn = pool.get().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await.map(drop) })
    };
    wait_for_waiters(&pool, 1).await;

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    assert_eq!(pool.status().waiting, 0);

    drop(conn);
    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.in_use, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grant_and_timeout_race_resolves_once() {
    let pool = pool(1);
    let mut events = pool.subscribe();

    for i in 0..200u64 {
        let conn = pool.get().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire("racer", Some(Duration::from_millis(1)))
                    .await
                    .map(drop)
            })
        };
        // Release around the waiter's deadline, sometimes before and
        // sometimes after it.
        tokio::time::sleep(Duration::from_micros(500 + (i % 5) * 200)).await;
        drop(conn);

        match waiter.await.unwrap() {
            Ok(()) | Err(PoolError::Timeout(TimeoutType::Wait)) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }

        // Whatever won, the connection is back and nothing is queued.
        let status = pool.status();
        assert_eq!(status.size, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.waiting, 0);
    }

    // Every checkout is matched by exactly one checkin.
    let mut checkouts = 0;
    let mut checkins = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::Checkout { .. } => checkouts += 1,
            PoolEvent::Checkin { .. } => checkins += 1,
            _ => {}
        }
    }
    assert_eq!(checkouts, checkins);
    assert_eq!(pool.manager().created.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_is_never_exceeded_under_contention() {
    let pool = Pool::builder(Manager::default())
        .base_size(2)
        .max_overflow(3)
        .build()
        .unwrap();
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let pool = pool.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    let conn = pool.acquire(format!("worker-{}", i), None).await.unwrap();
                    let status = pool.status();
                    assert!(status.in_use + status.idle <= status.base_size + status.overflow);
                    assert!(status.overflow <= status.max_overflow);
                    let _ = peak.fetch_max(status.in_use, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                    drop(conn);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::Relaxed) <= 5);
    assert!(pool.manager().created.load(Ordering::SeqCst) <= 5);
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.waiting, 0);
}
