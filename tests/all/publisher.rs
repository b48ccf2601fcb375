use crate::helpers::{configuration, FakeBroker};
use fake::{Fake, Faker};
use std::sync::Arc;
use std::time::Duration;
use warren::amqp::configuration::ConfigurationError;
use warren::pool::ServerPool;
use warren::publishers::{Message, Publisher, PublisherError};

fn publisher(broker: &FakeBroker) -> Publisher<FakeBroker> {
    let servers = Arc::new(ServerPool::new(Arc::new(broker.clone())));
    Publisher::builder(servers, Arc::new(configuration())).build()
}

#[tokio::test]
async fn messages_are_published_once_per_configured_routing_key() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker);
    let payload: String = Faker.fake();

    publisher
        .publish(Message::new(payload.clone()), "test", "local", &[])
        .await
        .unwrap();

    let published = broker.published();
    let routing_keys: Vec<_> = published.iter().map(|p| p.routing_key.as_str()).collect();
    assert_eq!(vec!["a.b", "c.d"], routing_keys);
    for message in &published {
        assert_eq!("test.exchange", message.exchange);
        assert_eq!(payload.as_bytes(), message.payload.as_slice());
        assert!(message.properties.timestamp().is_some());
        assert!(message.properties.message_id().is_some());
    }
    // Every copy of the message shares the same identity.
    assert_eq!(
        published[0].properties.message_id(),
        published[1].properties.message_id()
    );
}

#[tokio::test]
async fn explicit_routing_keys_override_the_configured_ones() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker);

    publisher
        .publish(Message::new("payload"), "test", "local", &["x.y"])
        .await
        .unwrap();

    let routing_keys: Vec<_> = broker
        .published()
        .into_iter()
        .map(|p| p.routing_key)
        .collect();
    assert_eq!(vec!["x.y".to_string()], routing_keys);
}

#[tokio::test]
async fn queues_without_routing_keys_publish_with_the_empty_key() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker);

    publisher
        .publish(Message::new("payload"), "orders", "local", &[])
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(1, published.len());
    assert_eq!("orders", published[0].exchange);
    assert_eq!("", published[0].routing_key);
}

#[tokio::test]
async fn connections_are_shared_across_publishes() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker);

    for _ in 0..10 {
        publisher
            .publish(Message::new("payload"), "orders", "local", &[])
            .await
            .unwrap();
    }

    assert_eq!(10, broker.published().len());
    assert_eq!(1, broker.publisher_dials());
}

#[tokio::test]
async fn unknown_queues_and_servers_are_rejected() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker);

    let outcome = publisher
        .publish(Message::new("payload"), "missing", "local", &[])
        .await;
    assert!(matches!(
        outcome,
        Err(PublisherError::Configuration(ConfigurationError::UnknownQueue(_)))
    ));

    let outcome = publisher
        .publish(Message::new("payload"), "orders", "elsewhere", &[])
        .await;
    assert!(matches!(
        outcome,
        Err(PublisherError::Configuration(ConfigurationError::UnknownServer(_)))
    ));

    assert_eq!(0, broker.publisher_dials());
}

#[tokio::test]
async fn broker_failures_are_surfaced() {
    let broker = FakeBroker::new();
    broker.fail_publishes_to("c.d");
    let publisher = publisher(&broker);

    let outcome = publisher
        .publish(Message::new("payload"), "test", "local", &[])
        .await;

    assert!(matches!(outcome, Err(PublisherError::Pool(_))));
    assert_eq!(1, broker.published().len());
}

#[tokio::test(start_paused = true)]
async fn slow_publishes_time_out() {
    let broker = FakeBroker::new();
    broker.set_publish_delay(Duration::from_secs(10));
    let servers = Arc::new(ServerPool::new(Arc::new(broker.clone())));
    let publisher = Publisher::builder(servers, Arc::new(configuration()))
        .publish_timeout(Duration::from_secs(1))
        .build();

    let outcome = publisher
        .publish(Message::new("payload"), "orders", "local", &[])
        .await;

    assert!(matches!(outcome, Err(PublisherError::TimeoutError)));
    assert!(broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn a_slow_dial_still_joins_the_pool_after_the_publish_timed_out() {
    let broker = FakeBroker::new();
    broker.set_dial_delay(Duration::from_secs(4));
    let servers = Arc::new(ServerPool::new(Arc::new(broker.clone())));
    let publisher = Publisher::builder(Arc::clone(&servers), Arc::new(configuration()))
        .publish_timeout(Duration::from_secs(3))
        .build();

    let outcome = publisher
        .publish(Message::new("payload"), "orders", "local", &[])
        .await;
    assert!(matches!(outcome, Err(PublisherError::TimeoutError)));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(1, broker.publisher_dials());
    assert_eq!(1, servers.get("local").unwrap().live_connections());

    for _ in 0..5 {
        publisher
            .publish(Message::new("payload"), "orders", "local", &[])
            .await
            .unwrap();
    }
    assert_eq!(5, broker.published().len());
    assert_eq!(1, broker.publisher_dials());
}

#[tokio::test]
async fn properties_set_on_the_message_are_published_as_is() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker);
    let message = Message::new("{}")
        .with_content_type("application/json".into())
        .with_message_id("order-42".into())
        .with_delivery_mode(2);

    publisher
        .publish(message, "orders", "local", &[])
        .await
        .unwrap();

    let properties = &broker.published()[0].properties;
    assert_eq!(
        Some("application/json"),
        properties.content_type().as_ref().map(|c| c.as_str())
    );
    assert_eq!(
        Some("order-42"),
        properties.message_id().as_ref().map(|id| id.as_str())
    );
    assert_eq!(&Some(2), properties.delivery_mode());
    assert!(properties.timestamp().is_some());
}
