// tests/transport_memory.rs

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use mom_bridge::{
    // ---
    Address,
    BrokerUrl,
    Connector,
    MemoryBroker,
    Message,
    QueueOptions,
};

fn event(queue: &str, body: &'static [u8]) -> Message {
    Message::event(Address::from(queue), "k", Bytes::from_static(body))
}

#[tokio::test]
async fn memory_subscribe_then_publish_delivers() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new("mt-deliver");
    let link = broker.open_link().expect("failed to open link");
    link.declare_queue("test.queue", QueueOptions::durable(false)).await.expect("declare failed");

    let mut sub = link.subscribe("test.queue").await.expect("subscribe failed");

    // ---
    // Act
    // ---
    link.publish(event("test.queue", b"hello")).await.expect("publish failed");

    // ---
    // Assert
    // ---
    let received = timeout(Duration::from_millis(100), sub.inbox.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription channel closed unexpectedly");

    assert_eq!(received.message.payload().as_ref(), b"hello");
    assert_eq!(received.message.address().as_str(), "test.queue");

    link.ack(received.tag).await.expect("ack failed");
    assert_eq!(broker.stats().acked, 1);
}

#[tokio::test]
async fn memory_connector_uses_url_scheme() {
    // ---
    let broker = MemoryBroker::new("mt-connector");

    let ok = broker.connect(&BrokerUrl::parse("memory://mt-connector").unwrap()).await;
    assert!(ok.is_ok());

    let wrong = broker.connect(&BrokerUrl::parse("amqp://localhost:5672").unwrap()).await;
    assert!(wrong.is_err());
}

#[tokio::test]
async fn memory_unacked_deliveries_survive_lost_link() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new("mt-redeliver");
    let first = broker.open_link().expect("failed to open link");
    first
        .declare_queue("work", QueueOptions::durable(false))
        .await
        .expect("declare failed");
    let mut sub = first.subscribe("work").await.expect("subscribe failed");

    first.publish(event("work", b"one")).await.expect("publish failed");
    first.publish(event("work", b"two")).await.expect("publish failed");
    assert!(sub.inbox.recv().await.is_some());
    assert!(sub.inbox.recv().await.is_some());

    // ---
    // Act
    // ---
    broker.sever();

    let second = broker.open_link().expect("failed to reopen link");
    let mut sub = second.subscribe("work").await.expect("resubscribe failed");

    // ---
    // Assert
    // ---
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let delivery = timeout(Duration::from_millis(100), sub.inbox.recv())
            .await
            .expect("timed out waiting for redelivery")
            .expect("subscription channel closed unexpectedly");
        bodies.push(delivery.message.into_payload());
        second.ack(delivery.tag).await.expect("ack failed");
    }

    assert_eq!(bodies, vec![Bytes::from("one"), Bytes::from("two")]);
    assert_eq!(broker.stats().requeued, 2);
    assert_eq!(broker.unacked_count("work"), Some(0));
}

#[tokio::test]
async fn memory_reply_queue_goes_away_with_its_owner() {
    // ---
    let broker = MemoryBroker::new("mt-auto-delete");
    let link = broker.open_link().expect("failed to open link");
    link.declare_queue("main_queue.reply.n1", QueueOptions::ephemeral())
        .await
        .expect("declare failed");
    let _sub = link.subscribe("main_queue.reply.n1").await.expect("subscribe failed");

    link.close().await.expect("close failed");

    assert_eq!(broker.queue_depth("main_queue.reply.n1"), None);
}
