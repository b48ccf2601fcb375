use crate::helpers::{server, FakeBroker};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use warren::amqp::BasicProperties;
use warren::pool::{ConnectionPool, PoolError, PoolPolicy, ServerPool};

fn pool(broker: &FakeBroker, policy: PoolPolicy) -> Arc<ConnectionPool<FakeBroker>> {
    Arc::new(ConnectionPool::new(
        Arc::new(broker.clone()),
        server(),
        policy,
    ))
}

/// Every request calls for a new connection, until the pool is full.
fn eager() -> PoolPolicy {
    PoolPolicy {
        rps_per_connection: 1,
        ..PoolPolicy::default()
    }
}

fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

#[tokio::test]
async fn the_first_request_dials_and_later_ones_reuse_the_connection() {
    let broker = FakeBroker::new();
    let pool = pool(&broker, PoolPolicy::default());
    assert_eq!(0, pool.live_connections());

    let first = pool.get_connection().await.unwrap();
    let second = pool.get_connection().await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(1, broker.publisher_dials());
    assert_eq!(1, pool.live_connections());
}

#[tokio::test]
async fn the_pool_grows_with_the_request_rate() {
    let broker = FakeBroker::new();
    let pool = pool(
        &broker,
        PoolPolicy {
            rps_per_connection: 10,
            ..PoolPolicy::default()
        },
    );

    // The target is `requests * 3 / 10`: the first request dials because the pool is empty,
    // the 7th because the target reaches 2.
    for _ in 0..6 {
        pool.get_connection().await.unwrap();
    }
    assert_eq!(1, broker.publisher_dials());
    pool.get_connection().await.unwrap();
    assert_eq!(2, broker.publisher_dials());

    for _ in 0..100 {
        pool.get_connection().await.unwrap();
    }
    assert_eq!(3, broker.publisher_dials());
    assert_eq!(3, pool.live_connections());
    assert_eq!(107, pool.requests_in_window());
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_never_dial_more_than_max_connections() {
    let broker = FakeBroker::new();
    broker.set_dial_delay(Duration::from_millis(100));
    let pool = pool(&broker, eager());

    let connections = join_all((0..20).map(|_| pool.get_connection())).await;

    assert!(connections.iter().all(Result::is_ok));
    assert_eq!(3, broker.publisher_dials());
    assert_eq!(3, pool.live_connections());
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_wait_for_the_first_dial_when_no_growth_is_needed() {
    let broker = FakeBroker::new();
    broker.set_dial_delay(Duration::from_millis(100));
    let pool = pool(&broker, PoolPolicy::default());

    let connections = join_all((0..20).map(|_| pool.get_connection())).await;

    let ids: Vec<_> = connections.into_iter().map(|c| c.unwrap().id()).collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(1, broker.publisher_dials());
}

#[tokio::test(start_paused = true)]
async fn a_dial_outlives_a_caller_that_gave_up_waiting() {
    let broker = FakeBroker::new();
    broker.set_dial_delay(Duration::from_secs(4));
    let pool = pool(&broker, PoolPolicy::default());

    let impatient = tokio::time::timeout(Duration::from_secs(1), pool.get_connection()).await;
    assert!(impatient.is_err());
    assert_eq!(0, pool.live_connections());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(1, broker.publisher_dials());
    assert_eq!(1, pool.live_connections());

    let started = Instant::now();
    let connection = pool.get_connection().await.unwrap();
    assert_eq!(0, connection.id());
    assert_eq!(Duration::ZERO, started.elapsed());
    assert_eq!(1, broker.publisher_dials());
}

#[tokio::test]
async fn connections_are_handed_out_round_robin() {
    let broker = FakeBroker::new();
    let pool = pool(&broker, eager());
    for _ in 0..3 {
        pool.get_connection().await.unwrap();
    }
    assert_eq!(3, pool.live_connections());

    let mut visits = Vec::new();
    for _ in 0..6 {
        visits.push(pool.get_connection().await.unwrap().id());
    }

    assert_eq!(vec![0, 1, 2, 0, 1, 2], visits);
    assert_eq!(3, broker.publisher_dials());
}

#[tokio::test]
async fn idle_connections_are_flagged_then_closed_after_the_grace_period() {
    let broker = FakeBroker::new();
    let pool = pool(&broker, PoolPolicy::default());
    let start = Instant::now();
    let first = pool.get_connection().await.unwrap().id();

    pool.reclaim(start + Duration::from_secs(5)).await;
    assert_eq!(1, pool.live_connections());
    assert_eq!(0, pool.requests_in_window());

    // Past the 10s idle deadline: flagged, but still open.
    pool.reclaim(start + Duration::from_secs(11)).await;
    assert_eq!(0, pool.live_connections());
    assert_eq!(1, pool.retiring_connections());
    assert!(broker.closed_publishers().is_empty());

    // A flagged connection is never handed out again.
    let second = pool.get_connection().await.unwrap().id();
    assert_ne!(first, second);
    assert_eq!(2, broker.publisher_dials());

    pool.reclaim(start + Duration::from_secs(20)).await;
    assert!(broker.closed_publishers().is_empty());

    pool.reclaim(start + Duration::from_secs(21)).await;
    assert_eq!(vec![first as usize], broker.closed_publishers());
}

#[tokio::test]
async fn a_failed_publish_flags_the_connection_and_stops_at_the_first_error() {
    let broker = FakeBroker::new();
    broker.fail_publishes_to("boom");
    let pool = pool(&broker, PoolPolicy::default());

    let outcome = pool
        .publish(
            "orders",
            &keys(&["ok", "boom", "after"]),
            b"payload",
            &BasicProperties::default(),
        )
        .await;

    assert!(matches!(
        outcome,
        Err(PoolError::Publish { ref routing_key, .. }) if routing_key == "boom"
    ));
    let routing_keys: Vec<_> = broker
        .published()
        .into_iter()
        .map(|p| p.routing_key)
        .collect();
    assert_eq!(vec!["ok".to_string()], routing_keys);
    assert_eq!(0, pool.live_connections());
    assert_eq!(1, pool.retiring_connections());

    pool.publish("orders", &keys(&["ok"]), b"payload", &BasicProperties::default())
        .await
        .unwrap();
    assert_eq!(2, broker.publisher_dials());
    assert_eq!(1, broker.published()[1].connection);
}

#[tokio::test]
async fn overused_connections_are_retired() {
    let broker = FakeBroker::new();
    let pool = pool(
        &broker,
        PoolPolicy {
            max_messages_per_connection: 2,
            ..PoolPolicy::default()
        },
    );
    let properties = BasicProperties::default();

    pool.publish("orders", &keys(&["a"]), b"1", &properties)
        .await
        .unwrap();
    pool.reclaim(Instant::now()).await;
    assert_eq!(1, pool.live_connections());

    pool.publish("orders", &keys(&["a"]), b"2", &properties)
        .await
        .unwrap();
    pool.reclaim(Instant::now()).await;
    assert_eq!(0, pool.live_connections());
    assert_eq!(1, pool.retiring_connections());
}

#[tokio::test]
async fn a_failed_dial_gives_the_slot_back() {
    let broker = FakeBroker::new();
    broker.fail_next_publisher_dials(1);
    let pool = pool(&broker, PoolPolicy::default());

    assert!(matches!(
        pool.get_connection().await,
        Err(PoolError::Dial(_))
    ));
    assert_eq!(0, pool.live_connections());

    pool.get_connection().await.unwrap();
    assert_eq!(1, pool.live_connections());
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let broker = FakeBroker::new();
    let pool = pool(&broker, eager());
    pool.get_connection().await.unwrap();
    let flagged = pool.get_connection().await.unwrap();
    pool.flag(&flagged);

    pool.shutdown().await;

    let mut closed = broker.closed_publishers();
    closed.sort_unstable();
    assert_eq!(vec![0, 1], closed);
    assert!(matches!(
        pool.get_connection().await,
        Err(PoolError::Closed)
    ));
}

#[tokio::test]
async fn flagging_twice_is_harmless() {
    let broker = FakeBroker::new();
    let pool = pool(&broker, PoolPolicy::default());
    let connection = pool.get_connection().await.unwrap();

    pool.flag(&connection);
    pool.flag(&connection);

    assert_eq!(1, pool.retiring_connections());
}

#[tokio::test]
async fn the_server_pool_creates_one_pool_per_server() {
    let broker = FakeBroker::new();
    let servers = ServerPool::new(Arc::new(broker.clone()));

    let first = servers.get_or_create("local", &server());
    let second = servers.get_or_create("local", &server());
    let other = servers.get_or_create("other", &server());

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(2, servers.len());
    assert_eq!(3, first.max_connections());
    assert!(servers.get("missing").is_none());

    servers.shutdown().await;
    assert!(servers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn the_reclaimer_retires_idle_connections_in_the_background() {
    let broker = FakeBroker::new();
    let servers = ServerPool::new(Arc::new(broker.clone()));
    let pool = servers.get_or_create("local", &server());
    pool.get_connection().await.unwrap();

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(0, pool.live_connections());
    assert_eq!(1, pool.retiring_connections());
    assert!(broker.closed_publishers().is_empty());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(vec![0], broker.closed_publishers());
    assert_eq!(0, pool.retiring_connections());

    servers.shutdown().await;
}
