#![allow(dead_code)]

//! Shared harness for public-API integration tests: clusters of nodes on
//! one in-memory hub, with compressed maintenance timings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lodestore::{MemoryHub, Node, NodeConfig, Strategy};

pub fn unique_root(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir()
        .join("lodestore-e2e")
        .join(format!("{tag}-{nanos}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn test_config(root: PathBuf, index: usize, strategy: Strategy) -> NodeConfig {
    let mut config = NodeConfig::for_tests(root);
    config.strategy = strategy;
    config.listen_addr = format!("10.7.{}.{}:4100", index / 256, index % 256);
    // Background churn stays slow enough not to dominate small tests.
    config.refresh_interval = Duration::from_secs(2);
    config.refresh_after = Duration::from_secs(60);
    config.republish_interval = Duration::from_secs(60);
    config.announce_interval = Duration::from_millis(200);
    config
}

pub struct Cluster {
    pub hub: Arc<MemoryHub>,
    pub nodes: Vec<Node>,
    pub roots: Vec<PathBuf>,
}

impl Cluster {
    /// Start `size` nodes on one hub; nodes 1.. bootstrap through node 0.
    pub async fn start(tag: &str, size: usize, strategy: Strategy) -> Self {
        let hub = MemoryHub::new();
        let mut nodes = Vec::with_capacity(size);
        let mut roots = Vec::with_capacity(size);

        let root = unique_root(&format!("{tag}-0"));
        let first = Node::builder()
            .config(test_config(root.clone(), 0, strategy))
            .memory_hub(hub.clone())
            .build();
        first.start().await.unwrap();
        let seed = first.contact().await.unwrap();
        nodes.push(first);
        roots.push(root);

        for index in 1..size {
            let root = unique_root(&format!("{tag}-{index}"));
            let node = Node::builder()
                .config(test_config(root.clone(), index, strategy))
                .memory_hub(hub.clone())
                .bootstrap(vec![seed.clone()])
                .build();
            node.start().await.unwrap();
            nodes.push(node);
            roots.push(root);
        }
        Self { hub, nodes, roots }
    }

    /// Kill a node abruptly: unreachable to peers, shelf gone.
    pub async fn kill(&self, index: usize) {
        let id = self.nodes[index].id().await.unwrap();
        self.hub.remove(&id);
    }

    pub async fn teardown(self) {
        for node in &self.nodes {
            let _ = node.stop().await;
        }
        for root in &self.roots {
            std::fs::remove_dir_all(root).ok();
        }
    }
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed as u64) as u8)
        .collect()
}
