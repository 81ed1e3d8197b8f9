//! Client surface behavior against a scripted standalone server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{standalone_identity, test_config, MockServer};
use mongolink_client::{Client, ClusterType, Connection, FutureCallback};
use mongolink_core::bson::Document;
use mongolink_core::wire::{Message, Query};
use mongolink_core::ReadPreferenceMode;

fn query(marker: i32) -> Arc<dyn Message> {
    Arc::new(Query::new(
        "db",
        "coll",
        Document::new().with("marker", marker),
    ))
}

#[tokio::test]
async fn test_client_send_round_trip() {
    let server = MockServer::start().await;
    server.set_fallback(standalone_identity());

    let client = Client::connect(test_config(&[server.name()])).await.unwrap();
    assert_eq!(client.cluster_type(), ClusterType::Standalone);
    assert_eq!(
        client.default_read_preference().mode(),
        ReadPreferenceMode::Primary
    );
    assert!(client.default_durability().requires_ack());

    let (callback, receiver) = FutureCallback::new();
    let server_name = client.send(query(1), Some(Box::new(callback))).await.unwrap();
    assert_eq!(server_name, server.name());

    let reply = receiver.recv().await.unwrap();
    assert_eq!(reply.documents().len(), 1);

    client.close().await;
}

#[tokio::test]
async fn test_client_reuses_connection_across_sends() {
    let server = MockServer::start().await;
    server.set_fallback(standalone_identity());

    let client = Client::connect(test_config(&[server.name()])).await.unwrap();

    for marker in 0..3 {
        let (callback, receiver) = FutureCallback::new();
        client.send(query(marker), Some(Box::new(callback))).await.unwrap();
        receiver.recv().await.unwrap();
    }

    // One bootstrap probe plus a single long-lived connection: request
    // ids on that connection keep counting up rather than restarting.
    let queries: Vec<i32> = server
        .received()
        .iter()
        .filter(|(_, op)| *op == 2004)
        .map(|(request_id, _)| *request_id)
        .collect();
    let trailing = &queries[queries.len() - 3..];
    assert_eq!(trailing, &[1, 2, 3][..]);

    client.close().await;
}

#[tokio::test]
async fn test_serialized_client_pins_one_connection() {
    let server = MockServer::start().await;
    server.set_fallback(standalone_identity());

    let client = Client::connect(test_config(&[server.name()])).await.unwrap();
    let serialized = client.serialized();

    assert_eq!(serialized.cluster_type(), ClusterType::Standalone);

    for marker in 0..3 {
        let (callback, receiver) = FutureCallback::new();
        serialized
            .send(query(marker), Some(Box::new(callback)))
            .await
            .unwrap();
        receiver.recv().await.unwrap();
    }

    client.close().await;
}

#[tokio::test]
async fn test_client_replaces_broken_connection() {
    let server = MockServer::start().await;
    server.set_fallback(standalone_identity());

    let client = Client::connect(test_config(&[server.name()])).await.unwrap();

    // Prime the connection, then break it behind the client's back.
    let (callback, receiver) = FutureCallback::new();
    client.send(query(1), Some(Box::new(callback))).await.unwrap();
    receiver.recv().await.unwrap();

    let connection = client.current_connection().await.unwrap();
    connection.shutdown(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The next send goes through a repaired connection.
    let (callback, receiver) = FutureCallback::new();
    let name = client.send(query(2), Some(Box::new(callback))).await.unwrap();
    assert_eq!(name, server.name());
    receiver.recv().await.unwrap();

    client.close().await;
}
