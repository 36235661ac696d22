//! LISTEN/NOTIFY delivery against the scripted server in `common`.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::{MockServer, opts};
use pgnx::{Connection, ConnectionState, Notification};
use tokio::sync::mpsc;

fn connection(server: &Arc<MockServer>) -> Connection {
    Connection::with_connector(opts(), server.connector()).expect("spawn worker")
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification delivered")
        .expect("sender alive")
}

#[tokio::test]
async fn notification_is_delivered_once() {
    let server = MockServer::new();
    let conn = connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();

    conn.listen("jobs", move |n| {
        let _ = tx.send(n);
    })
    .await
    .unwrap();
    assert_eq!(conn.state(), ConnectionState::Listening);

    server.notify("jobs", "42");
    let n = next(&mut rx).await;
    assert_eq!(n.channel(), "jobs");
    assert_eq!(n.payload(), "42");
    assert_eq!(n.pid(), 4242);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn notifications_arrive_in_order() {
    let server = MockServer::new();
    let conn = connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.listen("events", move |n| {
        let _ = tx.send(n);
    })
    .await
    .unwrap();

    for payload in ["a", "b", "c", "d"] {
        server.notify("events", payload);
    }
    let mut payloads = Vec::new();
    for _ in 0..4 {
        payloads.push(next(&mut rx).await.payload().to_string());
    }
    assert_eq!(payloads, ["a", "b", "c", "d"]);
}

#[tokio::test]
async fn callbacks_are_per_channel() {
    let server = MockServer::new();
    let conn = connection(&server);
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();

    conn.listen("a", move |n| {
        let _ = tx_a.send(n);
    })
    .await
    .unwrap();
    conn.listen("b", move |n| {
        let _ = tx_b.send(n);
    })
    .await
    .unwrap();

    server.notify("b", "for b");
    server.notify("a", "for a");
    assert_eq!(next(&mut rx_b).await.payload(), "for b");
    assert_eq!(next(&mut rx_a).await.payload(), "for a");
}

#[tokio::test]
async fn listen_again_replaces_callback() {
    let server = MockServer::new();
    let conn = connection(&server);
    let old_calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counter = Arc::clone(&old_calls);
    conn.listen("ch", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .unwrap();
    let before = server.simple_queries();
    conn.listen("ch", move |n| {
        let _ = tx.send(n);
    })
    .await
    .unwrap();
    assert_eq!(server.simple_queries(), before);

    server.notify("ch", "x");
    assert_eq!(next(&mut rx).await.payload(), "x");
    assert_eq!(old_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unlisten_stops_delivery() {
    let server = MockServer::new();
    let conn = connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.listen("ch", move |n| {
        let _ = tx.send(n);
    })
    .await
    .unwrap();

    conn.unlisten("ch").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);
    server.notify("ch", "late");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unlisten_unknown_channel_is_a_no_op() {
    let server = MockServer::new();
    let conn = connection(&server);
    conn.unlisten("never").await.unwrap();
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn overlong_channel_name_is_rejected() {
    let server = MockServer::new();
    let conn = connection(&server);
    let err = conn.listen(&"c".repeat(64), |_| {}).await.unwrap_err();
    assert!(matches!(err, pgnx::Error::InvalidUsage(_)), "{err:?}");
    assert_eq!(server.connects(), 0);

    conn.listen(&"c".repeat(63), |_| {}).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_callback_does_not_block_queries() {
    let server = MockServer::new();
    let conn = connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.listen("ch", move |n| {
        std::thread::sleep(Duration::from_millis(300));
        let _ = tx.send(n);
    })
    .await
    .unwrap();

    server.notify("ch", "slow");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    conn.query("SELECT 1", &[]).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(next(&mut rx).await.payload(), "slow");
}

#[tokio::test]
async fn notification_during_query_is_routed() {
    let server = MockServer::with_latency(Duration::from_millis(20), Duration::ZERO);
    let conn = connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.listen("ch", move |n| {
        let _ = tx.send(n);
    })
    .await
    .unwrap();

    server.notify("ch", "mid-query");
    let result = conn.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(next(&mut rx).await.payload(), "mid-query");
}

#[tokio::test]
async fn subscriptions_survive_reconnect() {
    let server = MockServer::new();
    let conn = connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.listen("ch", move |n| {
        let _ = tx.send(n);
    })
    .await
    .unwrap();

    server.break_next();
    assert!(conn.query("SELECT 1", &[]).await.is_err());
    conn.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(server.connects(), 2);

    server.notify("ch", "after");
    assert_eq!(next(&mut rx).await.payload(), "after");
}

#[tokio::test]
async fn listener_reconnects_without_further_calls() {
    let server = MockServer::new();
    let conn = connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.listen("ch", move |n| {
        let _ = tx.send(n);
    })
    .await
    .unwrap();

    server.break_poll();
    let started = Instant::now();
    while server.connects() < 2 {
        assert!(started.elapsed() < Duration::from_secs(2), "listener was not reopened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    server.notify("ch", "back");
    assert_eq!(next(&mut rx).await.payload(), "back");
    assert_eq!(conn.state(), ConnectionState::Listening);
}

#[tokio::test]
async fn panicking_callback_does_not_stop_delivery() {
    let server = MockServer::new();
    let conn = connection(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.listen("ch", move |n: Notification| {
        if n.payload() == "boom" {
            panic!("callback failure");
        }
        let _ = tx.send(n);
    })
    .await
    .unwrap();

    server.notify("ch", "boom");
    server.notify("ch", "ok");
    assert_eq!(next(&mut rx).await.payload(), "ok");
}
