use std::sync::Arc;
use std::time::Duration;

use streamedge_bus::{BusEvent, ConnectionPool};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::RedisStack;

async fn setup_redis() -> (String, ContainerAsync<RedisStack>) {
    let node = RedisStack::default()
        .start()
        .await
        .expect("failed to start redis");
    let host_port = node
        .get_host_port_ipv4(6379)
        .await
        .expect("could not get port");
    (format!("redis://127.0.0.1:{host_port}"), node)
}

#[tokio::test]
async fn published_messages_are_delivered_to_subscribers() {
    let (url, _node) = setup_redis().await;
    let pool = Arc::new(ConnectionPool::new(&url).unwrap());

    let mut rx = pool.subscribe(vec!["patterns".to_string()]).await;
    // give the background subscriber loop time to complete its SUBSCRIBE
    tokio::time::sleep(Duration::from_millis(200)).await;

    pool.publish("patterns", b"hello").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");

    match event {
        BusEvent::Message { topic, payload } => {
            assert_eq!(topic, "patterns");
            assert_eq!(payload, b"hello");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert!(pool.is_healthy());
}

#[tokio::test]
async fn reconnect_after_redis_restart_emits_reconnected_and_resumes_delivery() {
    let (url, mut node) = setup_redis().await;
    let pool = Arc::new(ConnectionPool::new(&url).unwrap());
    let mut rx = pool.subscribe(vec!["patterns".to_string()]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    node.stop().await.expect("failed to stop redis");
    tokio::time::sleep(Duration::from_millis(300)).await;
    node.start().await.expect("failed to restart redis");

    let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for reconnect")
        .expect("channel closed");
    assert!(matches!(event, BusEvent::Reconnected));

    pool.publish("patterns", b"after-reconnect").await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for post-reconnect message")
        .expect("channel closed");
    match event {
        BusEvent::Message { payload, .. } => assert_eq!(payload, b"after-reconnect"),
        other => panic!("unexpected event: {other:?}"),
    }
}
