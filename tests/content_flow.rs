//! End-to-end content flows over the public API.

mod common;

use std::time::Duration;

use common::{payload, unique_root, Cluster};
use lodestore::chunk::sha256_hex;
use lodestore::provider::StoreOptions;
use lodestore::{LodestoreError, Node, PublishMeta, Strategy};

#[tokio::test]
async fn single_node_publish_retrieve_with_exact_chunking() {
    let root = unique_root("single");
    let node = Node::builder()
        .config(common::test_config(root.clone(), 0, Strategy::LocalOnly))
        .build();
    node.start().await.unwrap();

    // 4_400_000 bytes at the default 1 MiB chunk: four full chunks plus a
    // 205_696-byte tail.
    let data: Vec<u8> = b"hello world"
        .iter()
        .copied()
        .cycle()
        .take(400_000 * 11)
        .collect();
    let chunk_size = 1024 * 1024;
    let record = node
        .publish_content(
            &data,
            PublishMeta::default(),
            StoreOptions {
                chunk_size: Some(chunk_size),
                ..StoreOptions::default()
            },
        )
        .await
        .unwrap();

    let meta = &record.metadata;
    assert_eq!(meta.size, data.len() as u64);
    assert_eq!(meta.chunks.len(), 5);
    for chunk in &meta.chunks[..4] {
        assert_eq!(chunk.size, chunk_size as u64);
    }
    assert_eq!(meta.chunks[4].size, (data.len() - 4 * chunk_size) as u64);
    assert_eq!(meta.checksum, sha256_hex(&data));

    let (bytes, _) = node.retrieve_content(&meta.id).await.unwrap();
    assert_eq!(bytes, data);

    node.stop().await.unwrap();
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn store_retrieve_round_trips_across_every_strategy() {
    for strategy in [
        Strategy::LocalOnly,
        Strategy::NetworkOnly,
        Strategy::P2pOnly,
        Strategy::Hybrid,
    ] {
        let cluster = Cluster::start(strategy.as_str(), 3, strategy).await;
        let data = payload(300_000, 7);

        let record = cluster.nodes[0]
            .publish_content(
                &data,
                PublishMeta::default(),
                StoreOptions {
                    chunk_size: Some(64 * 1024),
                    ..StoreOptions::default()
                },
            )
            .await
            .unwrap();

        let (bytes, _) = cluster.nodes[0]
            .retrieve_content(&record.metadata.id)
            .await
            .unwrap();
        assert_eq!(bytes, data, "publisher-side retrieve, {strategy:?}");

        cluster.teardown().await;
    }
}

#[tokio::test]
async fn other_nodes_retrieve_distributed_content() {
    for strategy in [Strategy::NetworkOnly, Strategy::P2pOnly, Strategy::Hybrid] {
        let cluster = Cluster::start("cross", 3, strategy).await;
        let data = payload(150_000, 3);

        let record = cluster.nodes[0]
            .publish_content(
                &data,
                PublishMeta::default(),
                StoreOptions {
                    chunk_size: Some(32 * 1024),
                    replicas: Some(2),
                    ..StoreOptions::default()
                },
            )
            .await
            .unwrap();

        // Give asynchronous replication and announcement polling a moment.
        tokio::time::sleep(Duration::from_millis(800)).await;

        let (bytes, fetched) = cluster.nodes[2]
            .retrieve_content(&record.metadata.id)
            .await
            .unwrap();
        assert_eq!(bytes, data, "cross-node retrieve, {strategy:?}");
        assert_eq!(fetched.metadata.checksum, record.metadata.checksum);

        cluster.teardown().await;
    }
}

#[tokio::test]
async fn deleted_content_is_gone_from_every_surface() {
    let root = unique_root("delete");
    let node = Node::builder()
        .config(common::test_config(root.clone(), 0, Strategy::LocalOnly))
        .build();
    node.start().await.unwrap();

    let record = node
        .publish_content(&payload(50_000, 9), PublishMeta::default(), StoreOptions::default())
        .await
        .unwrap();
    let id = record.metadata.id.clone();

    assert!(node.delete_content(&id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(
        node.retrieve_content(&id).await,
        Err(LodestoreError::NotFound(_))
    ));

    node.stop().await.unwrap();
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn version_history_via_node_api() {
    let root = unique_root("versions");
    let node = Node::builder()
        .config(common::test_config(root.clone(), 0, Strategy::LocalOnly))
        .build();
    node.start().await.unwrap();

    let record = node
        .publish_content(&payload(10_000, 1), PublishMeta::default(), StoreOptions::default())
        .await
        .unwrap();
    let id = record.metadata.id.clone();

    node.record_version(&id, "v1", None).await.unwrap();
    node.record_version(&id, "v2", Some("retrained".into()))
        .await
        .unwrap();
    assert!(matches!(
        node.record_version(&id, "v1", None).await,
        Err(LodestoreError::VersionExists(_))
    ));

    let versions = node.list_versions(&id).await.unwrap();
    assert_eq!(
        versions.iter().map(|v| v.version.as_str()).collect::<Vec<_>>(),
        vec!["v1", "v2"]
    );

    node.stop().await.unwrap();
    std::fs::remove_dir_all(&root).ok();
}
