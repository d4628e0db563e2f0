//! Single-flight and lifecycle behavior of the machine connection pool.

use std::sync::Arc;
use std::time::Duration;

use opshub_conn::manager::MachineConns;
use opshub_core::Error;
use opshub_test_utils::{machine_meta, CountingDialer, MemoryMachineStore};

type Pool = MachineConns<Arc<CountingDialer>, MemoryMachineStore>;

fn pool_with(dialer: &Arc<CountingDialer>, machines: &[(u64, Option<u64>)]) -> Arc<Pool> {
    let store = Arc::new(MemoryMachineStore::new());
    for (id, parent) in machines {
        store.insert(machine_meta(*id, *parent));
    }
    Arc::new(MachineConns::new(Arc::clone(dialer), store))
}

#[tokio::test]
async fn concurrent_burst_dials_once() {
    let dialer = Arc::new(CountingDialer::with_delay(Duration::from_millis(50)));
    let pool = pool_with(&dialer, &[(1, None)]);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move { pool.get(1).await }));
    }
    for task in tasks {
        let conn = task.await.unwrap().unwrap();
        assert_eq!(conn.id(), 1);
    }

    // Every waiter shared the one in-flight establishment.
    assert_eq!(dialer.total_dials(1), 1);
    assert_eq!(pool.live_connections(), 1);
}

#[tokio::test]
async fn repeated_gets_reuse_the_handle() {
    let dialer = Arc::new(CountingDialer::new());
    let pool = pool_with(&dialer, &[(1, None)]);

    pool.get(1).await.unwrap();
    pool.get(1).await.unwrap();
    pool.get(1).await.unwrap();

    assert_eq!(dialer.total_dials(1), 1);
}

#[tokio::test]
async fn dead_handle_is_closed_and_replaced() {
    let dialer = Arc::new(CountingDialer::new());
    let pool = pool_with(&dialer, &[(1, None)]);

    let first = pool.get(1).await.unwrap();
    first.kill();

    let second = pool.get(1).await.unwrap();
    assert!(second.alive());
    assert_eq!(dialer.total_dials(1), 2);
    assert_eq!(pool.live_connections(), 1);
}

#[tokio::test]
async fn invalidate_closes_and_forces_fresh_dial() {
    let dialer = Arc::new(CountingDialer::new());
    let pool = pool_with(&dialer, &[(1, None)]);

    let first = pool.get(1).await.unwrap();
    pool.invalidate(1).await;
    assert_eq!(first.close_count(), 1);
    assert_eq!(pool.live_connections(), 0);

    let second = pool.get(1).await.unwrap();
    assert!(second.alive());
    assert_eq!(dialer.total_dials(1), 2);

    // Invalidation is idempotent.
    pool.invalidate(1).await;
    pool.invalidate(1).await;
    assert_eq!(pool.live_connections(), 0);
}

#[tokio::test]
async fn concurrent_waiters_share_a_failure() {
    let dialer = Arc::new(CountingDialer::with_delay(Duration::from_millis(50)));
    dialer.fail(1, "connection refused");
    let pool = pool_with(&dialer, &[(1, None)]);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move { pool.get(1).await }));
    }
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport { id: 1, .. }));
    }

    // One attempt served every waiter, and the failure was not cached.
    assert_eq!(dialer.total_dials(1), 1);
    assert_eq!(pool.live_connections(), 0);
}

#[tokio::test]
async fn failure_then_recovery() {
    let dialer = Arc::new(CountingDialer::new());
    dialer.fail(1, "connection refused");
    let pool = pool_with(&dialer, &[(1, None)]);

    assert!(pool.get(1).await.is_err());

    dialer.heal(1);
    let conn = pool.get(1).await.unwrap();
    assert!(conn.alive());
    assert_eq!(dialer.total_dials(1), 2);
}

#[tokio::test]
async fn drain_closes_everything() {
    let dialer = Arc::new(CountingDialer::new());
    let pool = pool_with(&dialer, &[(1, None), (2, None)]);

    let first = pool.get(1).await.unwrap();
    let second = pool.get(2).await.unwrap();
    assert_eq!(pool.live_connections(), 2);

    pool.drain().await;
    assert_eq!(first.close_count(), 1);
    assert_eq!(second.close_count(), 1);
    assert_eq!(pool.live_connections(), 0);
}

#[tokio::test]
async fn unknown_machine_is_not_found() {
    let dialer = Arc::new(CountingDialer::new());
    let pool = pool_with(&dialer, &[]);
    assert!(matches!(pool.get(99).await, Err(Error::NotFound(99))));
}

#[tokio::test]
async fn disabled_machine_is_refused_without_dialing() {
    let dialer = Arc::new(CountingDialer::new());
    let store = Arc::new(MemoryMachineStore::new());
    let mut meta = machine_meta(1, None);
    meta.status = opshub_core::MachineStatus::Disabled;
    store.insert(meta);
    let pool: Pool = MachineConns::new(Arc::clone(&dialer), store);

    assert!(matches!(pool.get(1).await, Err(Error::Disabled(1))));
    assert_eq!(dialer.total_dials(1), 0);
}
