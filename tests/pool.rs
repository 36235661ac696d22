//! Pool behavior against the scripted server in `common`.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{MockServer, opts, silent_server};
use pgnx::{ConnectionState, Error, Pool, PoolConfig, PoolStatus, Value};
use tokio::sync::mpsc;

fn pool(server: &Arc<MockServer>, config: PoolConfig) -> Pool {
    Pool::with_connector(opts(), config, server.connector()).expect("valid pool")
}

#[tokio::test]
async fn released_connection_is_reused() {
    let server = MockServer::with_latency(Duration::ZERO, Duration::from_millis(100));
    let pool = pool(&server, PoolConfig::new().max(4));

    let started = Instant::now();
    let conn = pool.acquire().await.unwrap();
    let first_id = conn.id();
    conn.query("SELECT 1", &[]).await.unwrap();
    conn.release();
    let cold = started.elapsed();

    let started = Instant::now();
    let conn = pool.acquire().await.unwrap();
    conn.query("SELECT 1", &[]).await.unwrap();
    let warm = started.elapsed();

    assert_eq!(conn.id(), first_id);
    assert_eq!(server.connects(), 1);
    assert!(cold >= Duration::from_millis(100), "{cold:?}");
    assert!(warm < Duration::from_millis(50), "{warm:?}");
}

#[tokio::test]
async fn acquire_opens_up_to_max_then_times_out() {
    let server = MockServer::new();
    let pool = pool(
        &server,
        PoolConfig::new()
            .max(2)
            .connection_timeout(Duration::from_millis(100)),
    );

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(
        pool.status(),
        PoolStatus {
            idle: 0,
            in_use: 2,
            max: 2,
            closed: false,
        }
    );

    let started = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::PoolTimeout(_)), "{err:?}");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(server.connects(), 2);

    drop(a);
    let c = pool.acquire().await.unwrap();
    c.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(server.connects(), 2);
    drop(b);
}

#[tokio::test]
async fn waiters_are_served_in_arrival_order() {
    let server = MockServer::new();
    let pool = pool(&server, PoolConfig::new().max(1));
    let held = pool.acquire().await.unwrap();

    let (order_tx, mut order_rx) = mpsc::unbounded_channel();
    let mut waiters = Vec::new();
    for name in ["first", "second", "third"] {
        let pool = pool.clone();
        let order_tx = order_tx.clone();
        waiters.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            order_tx.send(name).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(conn);
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    drop(held);
    for waiter in waiters {
        waiter.await.unwrap();
    }
    let mut order = Vec::new();
    while let Ok(name) = order_rx.try_recv() {
        order.push(name);
    }
    assert_eq!(order, ["first", "second", "third"]);
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn query_releases_even_on_error() {
    let server = MockServer::new();
    let pool = pool(&server, PoolConfig::new().max(1));

    let err = pool.query("SELECT error", &[]).await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("42601"));

    let result = pool.query("SELECT $1", &[Value::from(5)]).await.unwrap();
    assert_eq!(result.rows()[0].get::<i64, _>(0).unwrap(), 5);
    assert_eq!(pool.status().idle, 1);
    assert_eq!(pool.status().in_use, 0);
}

#[tokio::test]
async fn pool_pipeline() {
    let server = MockServer::new();
    let pool = pool(&server, PoolConfig::new().max(1));

    let results = pool
        .pipeline(&["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"])
        .await
        .unwrap();
    let counts: Vec<_> = results.iter().map(|r| r.rows_affected()).collect();
    assert_eq!(counts, [Some(1), Some(1)]);
}

#[tokio::test]
async fn broken_connection_is_not_returned() {
    let server = MockServer::new();
    let pool = pool(&server, PoolConfig::new().max(1));

    let conn = pool.acquire().await.unwrap();
    conn.query("SELECT 1", &[]).await.unwrap();
    server.break_next();
    assert!(conn.query("SELECT 1", &[]).await.is_err());
    assert!(conn.is_broken());
    drop(conn);
    assert_eq!(pool.status().idle, 0);

    let conn = pool.acquire().await.unwrap();
    conn.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(server.connects(), 2);
}

#[tokio::test]
async fn failed_connect_frees_the_slot() {
    let server = MockServer::new();
    let pool = pool(
        &server,
        PoolConfig::new()
            .max(1)
            .connection_timeout(Duration::from_millis(100)),
    );

    server.refuse_connections(true);
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err:?}");

    server.refuse_connections(false);
    pool.acquire().await.unwrap();
}

#[tokio::test]
async fn test_before_acquire_skips_dead_connections() {
    let server = MockServer::new();
    let pool = pool(&server, PoolConfig::new().max(1).test_before_acquire(true));

    pool.query("SELECT 1", &[]).await.unwrap();
    server.break_next();
    let conn = pool.acquire().await.unwrap();
    conn.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(server.connects(), 2);
}

#[tokio::test]
async fn release_drops_subscriptions() {
    let server = MockServer::new();
    let pool = pool(&server, PoolConfig::new().max(1));

    let conn = pool.acquire().await.unwrap();
    conn.listen("jobs", |_| {}).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Listening);
    drop(conn);

    let conn = pool.acquire().await.unwrap();
    conn.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn idle_connections_are_evicted() {
    let server = MockServer::new();
    let pool = pool(
        &server,
        PoolConfig::new()
            .max(3)
            .idle_timeout(Duration::from_millis(100))
            .reap_interval(Duration::from_millis(25)),
    );

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    drop(a);
    drop(b);
    assert_eq!(pool.status().idle, 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pool.status().idle, 0);
    assert_eq!(server.terminates(), 2);
}

#[tokio::test]
async fn min_connections_are_kept_warm() {
    let server = MockServer::new();
    let pool = pool(
        &server,
        PoolConfig::new()
            .min(2)
            .max(4)
            .idle_timeout(Duration::from_millis(50))
            .reap_interval(Duration::from_millis(25)),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.status().idle, 2);
    assert_eq!(server.connects(), 2);
    assert_eq!(server.terminates(), 0);
}

#[tokio::test]
async fn end_rejects_waiters_and_closes_everything() {
    let server = MockServer::new();
    let pool = pool(
        &server,
        PoolConfig::new()
            .max(2)
            .connection_timeout(Duration::from_secs(10)),
    );

    let idle = pool.acquire().await.unwrap();
    let held = pool.acquire().await.unwrap();
    drop(idle);
    let extra = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.end().await;
    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter settled")
        .unwrap();
    assert!(matches!(result, Err(Error::PoolClosed)), "{result:?}");
    assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
    assert!(pool.status().closed);

    assert!(matches!(held.query("SELECT 1", &[]).await, Err(Error::Closed)));
    assert!(matches!(extra.query("SELECT 1", &[]).await, Err(Error::Closed)));
    drop(held);
    drop(extra);
    assert_eq!(pool.status().idle, 0);

    pool.end().await;
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let server = MockServer::new();
    let err = Pool::with_connector(opts(), PoolConfig::new().min(3).max(2), server.connector())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)), "{err:?}");

    let err = Pool::with_connector(
        opts(),
        PoolConfig::new().reap_interval(Duration::ZERO),
        server.connector(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)), "{err:?}");
}

#[tokio::test]
async fn acquire_gives_up_on_stalled_handshake() {
    let pool = Pool::with_config(
        silent_server(),
        PoolConfig::new()
            .max(1)
            .connection_timeout(Duration::from_millis(300)),
    )
    .unwrap();

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(3), pool.acquire())
        .await
        .expect("acquire settled");
    assert!(matches!(result, Err(Error::PoolTimeout(_))), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));

    let status = pool.status();
    assert_eq!((status.idle, status.in_use), (0, 0));
}

#[tokio::test]
async fn end_settles_acquire_stuck_in_handshake() {
    let pool = Pool::with_config(
        silent_server(),
        PoolConfig::new()
            .max(1)
            .connection_timeout(Duration::from_secs(30)),
    )
    .unwrap();

    let opening = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    pool.end().await;
    for waiter in [opening, queued] {
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire settled")
            .unwrap();
        assert!(matches!(result, Err(Error::PoolClosed)), "{result:?}");
    }
}


#[test]
fn pool_needs_a_runtime() {
    let server = MockServer::new();
    let err = Pool::with_connector(opts(), PoolConfig::new(), server.connector()).unwrap_err();
    assert!(matches!(err, Error::InvalidUsage(_)), "{err:?}");
}
