//! Two-node replication: content published on one node survives that
//! node's death.

mod common;

use std::time::Duration;

use common::{payload, Cluster};
use lodestore::provider::StoreOptions;
use lodestore::{PublishMeta, Strategy};

#[tokio::test]
async fn replicated_content_survives_publisher_death() {
    let cluster = Cluster::start("surv", 2, Strategy::NetworkOnly).await;
    let data = payload(3 * 1024 * 1024, 42);

    let record = cluster.nodes[0]
        .publish_content(
            &data,
            PublishMeta::default(),
            StoreOptions {
                replicas: Some(2),
                chunk_size: Some(1024 * 1024),
                ..StoreOptions::default()
            },
        )
        .await
        .unwrap();
    let id = record.metadata.id.clone();
    assert_eq!(record.metadata.chunks.len(), 3);

    // Both nodes can serve it while both are alive.
    let (bytes, _) = cluster.nodes[0].retrieve_content(&id).await.unwrap();
    assert_eq!(bytes, data);
    let (bytes, _) = cluster.nodes[1].retrieve_content(&id).await.unwrap();
    assert_eq!(bytes, data);

    // Tear down the publisher; the replica carries the artifact.
    cluster.kill(0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bytes, fetched) = cluster.nodes[1].retrieve_content(&id).await.unwrap();
    assert_eq!(bytes, data);
    assert_eq!(fetched.metadata.checksum, record.metadata.checksum);

    cluster.teardown().await;
}

#[tokio::test]
async fn dht_values_replicate_between_nodes() {
    let cluster = Cluster::start("kv", 2, Strategy::LocalOnly).await;

    cluster.nodes[0]
        .put("registry:shared", serde_json::json!({"owner": "a"}))
        .await
        .unwrap();

    // The second node resolves the value without ever writing it.
    let value = cluster.nodes[1].get("registry:shared").await.unwrap();
    assert_eq!(value, Some(serde_json::json!({"owner": "a"})));

    // And still resolves it after the writer disappears.
    cluster.kill(0).await;
    let value = cluster.nodes[1].get("registry:shared").await.unwrap();
    assert_eq!(value, Some(serde_json::json!({"owner": "a"})));

    cluster.teardown().await;
}
